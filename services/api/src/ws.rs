use crate::AppState;
use axum::{
    Json,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::{Instrument, debug, info, info_span, warn};
use viva_core::credentials::{AuthError, bearer_token};
use viva_core::{
    ClientMessage, ErrorKind, Identity, RouteError, ServerMessage, SessionHandle, SessionRegistry,
};

/// Close code sent to a connection whose session was taken over by a newer
/// connection for the same identity.
pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;
/// Sent when the session task stopped while the connection still owned it.
pub const INTERNAL_ERROR_CLOSE_CODE: u16 = 1011;
/// Sent to a client that floods a full queue.
pub const POLICY_CLOSE_CODE: u16 = 1008;

/// Rejections that may wait behind queued replies before the connection is
/// dropped.
const MAX_HELD_REPLIES: usize = 64;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Handles WebSocket upgrade requests.
///
/// The credential is taken from an `Authorization: Bearer` header, or from a
/// `token` query parameter for clients that cannot set headers. A connection
/// that fails validation is refused with `401` and an `AUTH_ERROR` body before
/// any upgrade happens.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token);

    let identity = match token {
        Some(token) => state.credentials.validate(&token),
        None => Err(AuthError::Missing),
    };

    match identity {
        Ok(identity) => {
            info!(%identity, "WebSocket upgrade accepted");
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        }
        Err(e) => {
            warn!("Rejected WebSocket upgrade: {e}");
            (
                StatusCode::UNAUTHORIZED,
                Json(ServerMessage::error(ErrorKind::AuthError, e.to_string())),
            )
                .into_response()
        }
    }
}

/// Drives one authenticated connection until either side goes away.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let mut handle = state.registry.attach(identity.clone()).await;
    let connection_id = handle.connection_id();
    let span = info_span!("connection", %identity, connection_id);

    async move {
        info!("WebSocket connection established");
        let exit = pump(socket, &state.registry, &mut handle).await;
        // A superseded connection no longer owns the identity; detaching it
        // would be a no-op at best.
        if exit != Exit::Superseded {
            state.registry.detach(&identity, connection_id).await;
        }
        info!(?exit, "WebSocket connection closed");
    }
    .instrument(span)
    .await
}

/// Why `pump` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The client went away or broke the connection.
    Closed,
    /// A newer connection for the same identity took the session over.
    Superseded,
    /// The session task stopped while this connection still owned it.
    SessionEnded,
    /// The client kept sending while its queue was full.
    Flooded,
}

// Moves client frames into the session and session replies out to the
// client.
//
// Every frame the client sends gets exactly one reply, and replies go out in
// the order the frames came in. Frames the session accepts are answered by the
// session task, which works through its inbox in order. The only replies made
// here are for frames turned away because the inbox is full; `ReplyOrder`
// holds those back until every reply owed before them has been sent.
async fn pump(mut socket: WebSocket, registry: &SessionRegistry, handle: &mut SessionHandle) -> Exit {
    let mut order = ReplyOrder::default();
    loop {
        tokio::select! {
            frame = socket.recv() => {
                let message = match frame {
                    Some(Ok(Message::Text(text))) => ClientMessage::from_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => {
                        ClientMessage::SubmitAnswer { audio: bytes.to_vec() }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        return Exit::Closed;
                    }
                };

                match registry.route(handle.identity(), handle.connection_id(), message).await {
                    Ok(()) => order.routed(),
                    Err(RouteError::Busy) => {
                        if order.held() >= MAX_HELD_REPLIES {
                            warn!("Client keeps sending while its queue is full; closing");
                            close(&mut socket, POLICY_CLOSE_CODE, "too many pending requests").await;
                            return Exit::Flooded;
                        }
                        let rejection = ServerMessage::error(
                            ErrorKind::ProtocolViolation,
                            RouteError::Busy.to_string(),
                        );
                        if let Some(reply) = order.local(rejection) {
                            if send(&mut socket, &reply).await.is_err() {
                                return Exit::Closed;
                            }
                        }
                    }
                    Err(RouteError::Detached) => return session_gone(socket, registry, handle).await,
                }
            }
            reply = handle.next_reply() => {
                let Some(reply) = reply else {
                    return session_gone(socket, registry, handle).await;
                };
                for reply in order.from_session(reply) {
                    if send(&mut socket, &reply).await.is_err() {
                        return Exit::Closed;
                    }
                }
            }
        }
    }
}

async fn send(socket: &mut WebSocket, reply: &ServerMessage) -> Result<(), axum::Error> {
    let json = match reply.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize reply: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(json.into())).await
}

/// The session behind this connection is gone. Either a newer connection
/// replaced it, or its task stopped on its own.
async fn session_gone(
    mut socket: WebSocket,
    registry: &SessionRegistry,
    handle: &SessionHandle,
) -> Exit {
    if registry.owns(handle.identity(), handle.connection_id()).await {
        warn!("Session task ended unexpectedly");
        close(&mut socket, INTERNAL_ERROR_CLOSE_CODE, "session ended unexpectedly").await;
        Exit::SessionEnded
    } else {
        info!("Session was taken over by a newer connection");
        close(&mut socket, SUPERSEDED_CLOSE_CODE, "superseded by a newer connection").await;
        Exit::Superseded
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {e}");
    }
}

/// Replies owed to the client, in the order their requests arrived.
#[derive(Default)]
struct ReplyOrder {
    slots: VecDeque<Slot>,
}

enum Slot {
    /// The session task owes this reply.
    Session,
    /// Made here, waiting for the session replies queued before it.
    Held(ServerMessage),
}

impl ReplyOrder {
    fn routed(&mut self) {
        self.slots.push_back(Slot::Session);
    }

    /// Takes a reply made by the connection itself. It is returned at once if
    /// nothing is owed before it, otherwise held.
    fn local(&mut self, reply: ServerMessage) -> Option<ServerMessage> {
        if self.slots.is_empty() {
            return Some(reply);
        }
        self.slots.push_back(Slot::Held(reply));
        None
    }

    /// Takes the session's next reply and returns everything now ready to go
    /// out, in order.
    fn from_session(&mut self, reply: ServerMessage) -> Vec<ServerMessage> {
        if matches!(self.slots.front(), Some(Slot::Session)) {
            self.slots.pop_front();
        }
        let mut ready = vec![reply];
        while matches!(self.slots.front(), Some(Slot::Held(_))) {
            if let Some(Slot::Held(held)) = self.slots.pop_front() {
                ready.push(held);
            }
        }
        ready
    }

    fn held(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Held(_)))
            .count()
    }
}

//! Tracks which connection owns each identity's quiz session.
//!
//! Every attached session is driven by its own task that owns the
//! `QuizSession` outright. Messages reach it through a bounded queue, so a
//! session handles one message at a time in arrival order, and a slow answer
//! for one identity never holds up another.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session_state::{Collaborators, QuizSession, SessionConfig};
use crate::types::Identity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

/// Distinguishes successive connections of the same identity.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The connection no longer owns a session, e.g. it was replaced by a
    /// newer connection for the same identity.
    #[error("this connection no longer has an active session")]
    Detached,
    #[error("too many requests are already waiting; wait for a reply before sending more")]
    Busy,
}

/// The connection side of an attached session.
pub struct SessionHandle {
    identity: Identity,
    connection_id: ConnectionId,
    replies: mpsc::Receiver<ServerMessage>,
}

impl SessionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Next reply from the session, in request order. `None` once the session
    /// has been detached or replaced.
    pub async fn next_reply(&mut self) -> Option<ServerMessage> {
        self.replies.recv().await
    }
}

struct ActiveSession {
    connection_id: ConnectionId,
    inbox: mpsc::Sender<ClientMessage>,
    task: JoinHandle<()>,
}

/// Maps each identity to the one session currently serving it.
///
/// A second connection for an identity that is already attached replaces the
/// first: the old session task is aborted and its connection sees its reply
/// stream end.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Identity, ActiveSession>>,
    deps: Collaborators,
    config: SessionConfig,
    next_connection: AtomicU64,
}

impl SessionRegistry {
    pub fn new(deps: Collaborators, config: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            deps,
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Starts a fresh session for `identity`, evicting any existing one.
    pub async fn attach(&self, identity: Identity) -> SessionHandle {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let depth = self.config.queue_depth.max(1);
        let (inbox, inbox_rx) = mpsc::channel(depth);
        let (reply_tx, replies) = mpsc::channel(depth);

        let coordinator = QuizSession::new(identity.clone(), self.deps.clone(), self.config.clone());
        let span = info_span!("session", identity = %identity, connection_id);
        let task = tokio::spawn(run_session(coordinator, inbox_rx, reply_tx).instrument(span));

        let previous = self.sessions.lock().await.insert(
            identity.clone(),
            ActiveSession {
                connection_id,
                inbox,
                task,
            },
        );
        if let Some(previous) = previous {
            info!(
                %identity,
                evicted = previous.connection_id,
                connection_id,
                "Replacing the existing session for this identity"
            );
            previous.task.abort();
        } else {
            info!(%identity, connection_id, "Session attached");
        }

        SessionHandle {
            identity,
            connection_id,
            replies,
        }
    }

    /// Queues `message` for the session owned by `connection_id`.
    pub async fn route(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), RouteError> {
        let sessions = self.sessions.lock().await;
        let active = sessions
            .get(identity)
            .filter(|active| active.connection_id == connection_id)
            .ok_or(RouteError::Detached)?;

        active.inbox.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RouteError::Busy,
            mpsc::error::TrySendError::Closed(_) => RouteError::Detached,
        })
    }

    /// Ends the session owned by `connection_id`, cancelling any answer still
    /// being processed. Returns `false` if that connection had already been
    /// replaced or detached.
    pub async fn detach(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(identity) {
            Some(active) if active.connection_id == connection_id => {
                if let Some(active) = sessions.remove(identity) {
                    active.task.abort();
                }
                info!(%identity, connection_id, "Session detached");
                true
            }
            _ => false,
        }
    }

    /// Whether `connection_id` is still the connection bound to `identity`.
    pub async fn owns(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        self.sessions
            .lock()
            .await
            .get(identity)
            .is_some_and(|active| active.connection_id == connection_id)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

// The body of a session task. It is the only owner of the `QuizSession`, so
// the coordinator needs no lock: messages are pulled from the inbox one at a
// time, and the next one is not looked at until the current reply has been
// handed to the connection. That is what keeps replies in request order.
//
// The loop ends when the connection side drops its reply receiver, or when the
// inbox sender is dropped by `detach`. Eviction and detach also abort the task,
// which cancels an answer pipeline midway; anything the pipeline had not yet
// written to the ledger is simply never written.
async fn run_session(
    mut coordinator: QuizSession,
    mut inbox: mpsc::Receiver<ClientMessage>,
    replies: mpsc::Sender<ServerMessage>,
) {
    debug!("Session task started");
    while let Some(message) = inbox.recv().await {
        let reply = coordinator.handle(message).await;
        if replies.send(reply).await.is_err() {
            break;
        }
    }
    debug!("Session task finished");
}

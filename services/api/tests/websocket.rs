use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use viva_api::{AppState, router};
use viva_core::credentials::JwtCredentials;
use viva_core::evaluator::Evaluator;
use viva_core::ledger::MemoryLedger;
use viva_core::question_store::{MemoryQuestionStore, QuestionStore};
use viva_core::transcriber::Transcriber;
use viva_core::{Collaborators, ErrorKind, Identity, ServerMessage, SessionConfig, SessionRegistry};

const SECRET: &[u8] = b"integration-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Treats the uploaded audio as UTF-8 text.
struct EchoTranscriber;

#[async_trait]
impl Transcriber for EchoTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> anyhow::Result<String> {
        Ok(String::from_utf8_lossy(audio).into_owned())
    }
}

/// Rewards answers that mention ordering, and forgets the score line for
/// answers that mumble. Answers that say "slowly" take a while to grade.
struct RubricEvaluator;

#[async_trait]
impl Evaluator for RubricEvaluator {
    async fn evaluate(&self, _question: &str, answer: &str) -> anyhow::Result<String> {
        if answer.contains("slowly") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if answer.contains("mumble") {
            Ok("I could not follow that answer.".to_string())
        } else if answer.contains("sorted") {
            Ok("Good explanation of the ordering property.\nScore: 8/10".to_string())
        } else {
            Ok("Too vague.\nScore: 3/10".to_string())
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    credentials: JwtCredentials,
    ledger: Arc<MemoryLedger>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(SessionConfig::default()).await
    }

    async fn start_with(config: SessionConfig) -> Self {
        let questions = Arc::new(MemoryQuestionStore::new());
        questions
            .replace_questions(
                &Identity::new("alice"),
                &[
                    "What is a linked list?".to_string(),
                    "What is a binary search tree?".to_string(),
                    "What is a hash map?".to_string(),
                ],
            )
            .await
            .unwrap();
        let ledger = Arc::new(MemoryLedger::new());

        let deps = Collaborators {
            questions,
            transcriber: Arc::new(EchoTranscriber),
            evaluator: Arc::new(RubricEvaluator),
            ledger: ledger.clone(),
        };
        let state = AppState {
            registry: Arc::new(SessionRegistry::new(deps, config)),
            credentials: Arc::new(JwtCredentials::new(SECRET)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            addr,
            credentials: JwtCredentials::new(SECRET),
            ledger,
        }
    }

    fn token(&self, identity: &str) -> String {
        self.credentials
            .issue(&Identity::new(identity), chrono::Duration::minutes(5))
            .unwrap()
    }

    async fn connect(&self, identity: &str) -> Client {
        let url = format!("ws://{}/real_time_answer", self.addr);
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token(identity)).parse().unwrap(),
        );
        let (client, _) = connect_async(request).await.unwrap();
        client
    }
}

async fn send_json(client: &mut Client, value: serde_json::Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_reply(client: &mut Client) -> ServerMessage {
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn error_kind(reply: &ServerMessage) -> Option<ErrorKind> {
    match reply {
        ServerMessage::Error { error } => Some(error.kind),
        _ => None,
    }
}

#[tokio::test]
async fn answering_a_question_returns_the_score_and_records_it() {
    // Arrange
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    // Act
    send_json(&mut client, serde_json::json!({ "question_index": 1 })).await;
    let question = next_reply(&mut client).await;
    send_json(
        &mut client,
        serde_json::json!({ "audio": STANDARD.encode("keys on the left are smaller, so an in-order walk is sorted") }),
    )
    .await;
    let evaluated = next_reply(&mut client).await;

    // Assert
    assert_eq!(
        question,
        ServerMessage::Question {
            question: "What is a binary search tree?".to_string()
        }
    );
    match evaluated {
        ServerMessage::Evaluated {
            transcribed_answer,
            evaluation,
            final_score,
            error,
        } => {
            assert!(transcribed_answer.contains("in-order walk"));
            assert!(evaluation.contains("Score: 8/10"));
            assert_eq!(final_score, 8);
            assert!(error.is_none());
        }
        other => panic!("expected an evaluation, got {other:?}"),
    }

    let records = server.ledger.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, Identity::new("alice"));
    assert_eq!(records[0].ordinal, 1);
    assert_eq!(records[0].score.value(), 8);
}

#[tokio::test]
async fn out_of_range_question_is_not_found() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    send_json(&mut client, serde_json::json!({ "question_index": 5 })).await;

    assert_eq!(error_kind(&next_reply(&mut client).await), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn audio_before_any_question_is_a_protocol_violation() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    send_json(&mut client, serde_json::json!({ "audio": STANDARD.encode("hello") })).await;
    let reply = next_reply(&mut client).await;

    assert_eq!(error_kind(&reply), Some(ErrorKind::ProtocolViolation));
    assert!(server.ledger.records().await.is_empty());
}

#[tokio::test]
async fn malformed_frames_get_an_error_and_the_session_survives() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    client.send(Message::Text("not json".to_string())).await.unwrap();
    let malformed = next_reply(&mut client).await;
    send_json(&mut client, serde_json::json!({ "question_index": 0 })).await;
    let question = next_reply(&mut client).await;

    assert_eq!(error_kind(&malformed), Some(ErrorKind::ProtocolViolation));
    assert_eq!(
        question,
        ServerMessage::Question {
            question: "What is a linked list?".to_string()
        }
    );
}

#[tokio::test]
async fn unparsable_score_is_reported_without_a_ledger_write() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    send_json(&mut client, serde_json::json!({ "question_index": 0 })).await;
    next_reply(&mut client).await;
    send_json(&mut client, serde_json::json!({ "audio": STANDARD.encode("mumble mumble") })).await;
    let reply = next_reply(&mut client).await;

    assert_eq!(error_kind(&reply), Some(ErrorKind::ScoreParseError));
    assert!(server.ledger.records().await.is_empty());
}

#[tokio::test]
async fn binary_frames_are_accepted_as_audio() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    send_json(&mut client, serde_json::json!({ "question_index": 2 })).await;
    next_reply(&mut client).await;
    client
        .send(Message::Binary(b"buckets indexed by a hash".to_vec()))
        .await
        .unwrap();
    let reply = next_reply(&mut client).await;

    assert!(matches!(
        reply,
        ServerMessage::Evaluated { final_score: 3, .. }
    ));
}

#[tokio::test]
async fn connections_without_a_valid_credential_are_refused() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/real_time_answer", server.addr);

    let missing = connect_async(url.as_str()).await;
    let forged = connect_async(format!("{url}?token=not-a-jwt")).await;

    for result in [missing, forged] {
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            Err(other) => panic!("expected an HTTP rejection, got {other}"),
            Ok(_) => panic!("connection should have been refused"),
        }
    }
}

#[tokio::test]
async fn query_parameter_credentials_are_accepted() {
    let server = TestServer::start().await;
    let url = format!(
        "ws://{}/real_time_answer?token={}",
        server.addr,
        server.token("alice")
    );

    let (mut client, _) = connect_async(url).await.unwrap();
    send_json(&mut client, serde_json::json!({ "question_index": 0 })).await;

    assert!(matches!(next_reply(&mut client).await, ServerMessage::Question { .. }));
}

#[tokio::test]
async fn a_second_connection_replaces_the_first() {
    // Arrange
    let server = TestServer::start().await;
    let mut first = server.connect("alice").await;
    send_json(&mut first, serde_json::json!({ "question_index": 0 })).await;
    next_reply(&mut first).await;

    // Act
    let mut second = server.connect("alice").await;

    // Assert: the first connection is closed with the takeover code.
    let close = loop {
        match first.next().await {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    };
    let frame = close.expect("close frame should carry a code");
    assert_eq!(u16::from(frame.code), 4000);

    // The new connection starts from an idle session.
    send_json(&mut second, serde_json::json!({ "audio": STANDARD.encode("late answer") })).await;
    assert_eq!(
        error_kind(&next_reply(&mut second).await),
        Some(ErrorKind::ProtocolViolation)
    );
}

#[tokio::test]
async fn health_reports_active_sessions() {
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;
    // A reply proves the session is attached.
    send_json(&mut client, serde_json::json!({ "question_index": 0 })).await;
    next_reply(&mut client).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut response = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response)
        .await
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""active_sessions":1"#));
}

#[tokio::test]
async fn a_malformed_frame_is_answered_after_earlier_requests() {
    // Arrange
    let server = TestServer::start().await;
    let mut client = server.connect("alice").await;

    // Act: the garbage arrives while the answer is still being graded.
    send_json(&mut client, serde_json::json!({ "question_index": 1 })).await;
    send_json(
        &mut client,
        serde_json::json!({ "audio": STANDARD.encode("slowly: an in-order walk is sorted") }),
    )
    .await;
    client.send(Message::Text("not json".to_string())).await.unwrap();

    // Assert: one reply per frame, in the order the frames were sent.
    assert!(matches!(next_reply(&mut client).await, ServerMessage::Question { .. }));
    assert!(matches!(
        next_reply(&mut client).await,
        ServerMessage::Evaluated { final_score: 8, .. }
    ));
    assert_eq!(
        error_kind(&next_reply(&mut client).await),
        Some(ErrorKind::ProtocolViolation)
    );
}

#[tokio::test]
async fn overflow_rejections_keep_their_place_in_line() {
    // Arrange: a single queued message may wait behind the one being graded.
    let server = TestServer::start_with(SessionConfig {
        queue_depth: 1,
        ..SessionConfig::default()
    })
    .await;
    let mut client = server.connect("alice").await;
    send_json(&mut client, serde_json::json!({ "question_index": 1 })).await;
    next_reply(&mut client).await;

    // Act
    send_json(
        &mut client,
        serde_json::json!({ "audio": STANDARD.encode("slowly: an in-order walk is sorted") }),
    )
    .await;
    for ordinal in 0..3 {
        send_json(&mut client, serde_json::json!({ "question_index": ordinal })).await;
    }
    let mut replies = Vec::new();
    for _ in 0..4 {
        replies.push(next_reply(&mut client).await);
    }

    // Assert: the graded answer comes first, and any question that made it
    // into the queue is answered before the rejections that followed it.
    assert!(matches!(replies[0], ServerMessage::Evaluated { final_score: 8, .. }));
    let rejected: Vec<_> = replies[1..].iter().filter_map(error_kind).collect();
    assert!(rejected.len() >= 2, "expected the queue to overflow: {replies:?}");
    assert!(rejected.iter().all(|kind| *kind == ErrorKind::ProtocolViolation));
    for (position, reply) in replies.iter().enumerate().skip(1) {
        if matches!(reply, ServerMessage::Question { .. }) {
            assert_eq!(position, 1, "a queued question was answered late: {replies:?}");
        }
    }
}

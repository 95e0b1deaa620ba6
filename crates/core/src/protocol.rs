//! JSON messages exchanged over the quiz WebSocket.

use crate::error::{ErrorKind, SessionError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `{"question_index": n}`
    RequestQuestion { ordinal: u32 },
    /// `{"audio": "<base64>"}`, or a binary frame.
    SubmitAnswer { audio: Vec<u8> },
    /// A frame that could not be decoded. It still travels through the
    /// session so its error reply keeps its place among the others.
    Invalid { reason: String },
}

// Both keys are optional on the wire so that the decoder can say which
// combination was wrong instead of a generic "did not match" error.
#[derive(Debug, Deserialize)]
struct RawRequest {
    question_index: Option<u32>,
    audio: Option<String>,
}

impl ClientMessage {
    /// Decodes a text frame, turning a failure into `Invalid`.
    pub fn from_text(text: &str) -> Self {
        Self::decode(text).unwrap_or_else(|e| Self::Invalid {
            reason: e.to_string(),
        })
    }

    /// Decodes a text frame. Every failure is a protocol violation.
    pub fn decode(text: &str) -> Result<Self, SessionError> {
        let raw: RawRequest = serde_json::from_str(text)
            .map_err(|e| SessionError::protocol(format!("malformed request: {e}")))?;

        match (raw.question_index, raw.audio) {
            (Some(ordinal), None) => Ok(Self::RequestQuestion { ordinal }),
            (None, Some(encoded)) => {
                let audio = STANDARD.decode(encoded.trim()).map_err(|e| {
                    SessionError::protocol(format!("audio is not valid base64: {e}"))
                })?;
                Ok(Self::SubmitAnswer { audio })
            }
            (Some(_), Some(_)) => Err(SessionError::protocol(
                "request must carry either `question_index` or `audio`, not both",
            )),
            (None, None) => Err(SessionError::protocol(
                "request must carry `question_index` or `audio`",
            )),
        }
    }
}

/// The `error` object of a server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SessionError> for ErrorBody {
    fn from(err: &SessionError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// A server reply. Serialized without a tag; the field names identify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Question {
        question: String,
    },
    /// A scored answer. `error` is only present when the score could not be
    /// written to the ledger; the result is still valid.
    Evaluated {
        transcribed_answer: String,
        evaluation: String,
        final_score: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Error {
        error: ErrorBody,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorBody::new(kind, message),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&SessionError> for ServerMessage {
    fn from(err: &SessionError) -> Self {
        Self::Error { error: err.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn violation(text: &str) -> String {
        let err = ClientMessage::decode(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        err.to_string()
    }

    #[test]
    fn decodes_question_requests() {
        assert_eq!(
            ClientMessage::decode(r#"{"question_index": 3}"#).unwrap(),
            ClientMessage::RequestQuestion { ordinal: 3 }
        );
    }

    #[test]
    fn decodes_base64_audio() {
        let encoded = STANDARD.encode(b"RIFF....WAVE");
        let text = json!({ "audio": encoded }).to_string();
        assert_eq!(
            ClientMessage::decode(&text).unwrap(),
            ClientMessage::SubmitAnswer {
                audio: b"RIFF....WAVE".to_vec()
            }
        );
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(violation("not json").starts_with("malformed request"));
        assert!(violation(r#"{"question_index": -1}"#).starts_with("malformed request"));
        assert!(violation(r#"{"question_index": "two"}"#).starts_with("malformed request"));
        assert!(violation(r#"{"audio": "%%%"}"#).starts_with("audio is not valid base64"));
        assert!(violation(r#"{"question_index": 0, "audio": "AA=="}"#).contains("not both"));
        assert_eq!(violation("{}"), "request must carry `question_index` or `audio`");
    }

    #[test]
    fn undecodable_text_becomes_an_invalid_message() {
        assert_eq!(
            ClientMessage::from_text("{}"),
            ClientMessage::Invalid {
                reason: "request must carry `question_index` or `audio`".to_string()
            }
        );
        assert_eq!(
            ClientMessage::from_text(r#"{"question_index": 1}"#),
            ClientMessage::RequestQuestion { ordinal: 1 }
        );
    }

    #[test]
    fn serializes_the_three_reply_shapes() {
        let question = ServerMessage::Question {
            question: "What is a binary search tree?".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&question).unwrap(),
            json!({ "question": "What is a binary search tree?" })
        );

        let evaluated = ServerMessage::Evaluated {
            transcribed_answer: "A tree where left < node < right".to_string(),
            evaluation: "Score: 8/10. Good definition.".to_string(),
            final_score: 8,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&evaluated).unwrap(),
            json!({
                "transcribed_answer": "A tree where left < node < right",
                "evaluation": "Score: 8/10. Good definition.",
                "final_score": 8
            })
        );

        let error = ServerMessage::error(ErrorKind::NotFound, "no question exists at index 5");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({ "error": { "kind": "NOT_FOUND", "message": "no question exists at index 5" } })
        );
    }

    #[test]
    fn error_only_replies_are_not_mistaken_for_results() {
        let text = r#"{"error":{"kind":"SCORE_PARSE_ERROR","message":"x"}}"#;
        let parsed: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(parsed, ServerMessage::Error { .. }));
    }
}

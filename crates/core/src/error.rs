use crate::score::ScoreParseError;
use serde::{Deserialize, Serialize};

/// The `kind` field of an error envelope sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthError,
    NotFound,
    ProtocolViolation,
    TranscriptionError,
    EvaluationError,
    ScoreParseError,
    PersistenceError,
    QuestionStoreError,
}

/// Failures a session recovers from by replying with an error envelope.
///
/// None of these end the connection; the session is back in its idle state
/// once one has been reported.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no question exists at index {ordinal}")]
    NotFound { ordinal: u32 },

    #[error("{0}")]
    ProtocolViolation(String),

    #[error("question store failed: {0:#}")]
    QuestionStore(#[source] anyhow::Error),

    #[error("transcription failed: {0:#}")]
    Transcription(#[source] anyhow::Error),

    #[error("evaluation failed: {0:#}")]
    Evaluation(#[source] anyhow::Error),

    #[error(transparent)]
    ScoreParse(#[from] ScoreParseError),

    #[error("failed to persist score: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl SessionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::QuestionStore(_) => ErrorKind::QuestionStoreError,
            Self::Transcription(_) => ErrorKind::TranscriptionError,
            Self::Evaluation(_) => ErrorKind::EvaluationError,
            Self::ScoreParse(_) => ErrorKind::ScoreParseError,
            Self::Persistence(_) => ErrorKind::PersistenceError,
        }
    }
}

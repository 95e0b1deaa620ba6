pub mod credentials;
pub mod error;
pub mod evaluator;
pub mod ledger;
pub mod postgres;
pub mod protocol;
pub mod question_store;
pub mod registry;
pub mod score;
pub mod session_state;
pub mod transcriber;
pub mod types;

pub use error::{ErrorKind, SessionError};
pub use protocol::{ClientMessage, ErrorBody, ServerMessage};
pub use registry::{RouteError, SessionHandle, SessionRegistry};
pub use session_state::{Collaborators, QuizSession, SessionConfig};
pub use types::{EvaluationRecord, Identity, Question, Score};

/// Root of the OpenAI REST API used by the default transcription and
/// evaluation clients.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

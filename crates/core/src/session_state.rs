use crate::error::SessionError;
use crate::evaluator::Evaluator;
use crate::ledger::ScoreLedger;
use crate::protocol::{ClientMessage, ErrorBody, ServerMessage};
use crate::question_store::QuestionStore;
use crate::score::parse_score;
use crate::transcriber::Transcriber;
use crate::types::{EvaluationRecord, Identity, Question, Score};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Whether the session is waiting for an answer to its active question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    None,
    AnswerPending,
}

/// In-memory state of one user's quiz exchange.
///
/// `awaiting == AnswerPending` only ever holds together with an active
/// question; both are changed through `serve` and `reset`.
#[derive(Debug)]
pub struct Session {
    identity: Identity,
    active_question: Option<Question>,
    awaiting: Awaiting,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            active_question: None,
            awaiting: Awaiting::None,
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn active_question(&self) -> Option<&Question> {
        self.active_question.as_ref()
    }

    pub fn awaiting(&self) -> Awaiting {
        self.awaiting
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn serve(&mut self, question: Question) -> &Question {
        self.awaiting = Awaiting::AnswerPending;
        self.active_question.insert(question)
    }

    /// Takes the question an answer is expected for, returning to idle.
    fn take_pending(&mut self) -> Option<Question> {
        let pending = match self.awaiting {
            Awaiting::AnswerPending => self.active_question.take(),
            Awaiting::None => None,
        };
        self.reset();
        pending
    }

    fn reset(&mut self) {
        self.active_question = None;
        self.awaiting = Awaiting::None;
    }
}

/// Limits applied to every adapter call a session makes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub question_timeout: Duration,
    pub transcription_timeout: Duration,
    pub evaluation_timeout: Duration,
    pub persistence_timeout: Duration,
    /// Total attempts for transcription, evaluation and persistence.
    pub max_attempts: u32,
    /// Messages that may wait behind the one being processed.
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            question_timeout: Duration::from_secs(5),
            transcription_timeout: Duration::from_secs(30),
            evaluation_timeout: Duration::from_secs(60),
            persistence_timeout: Duration::from_secs(5),
            max_attempts: 2,
            queue_depth: 8,
        }
    }
}

/// The external services a session talks to. Shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub questions: Arc<dyn QuestionStore>,
    pub transcriber: Arc<dyn Transcriber>,
    pub evaluator: Arc<dyn Evaluator>,
    pub ledger: Arc<dyn ScoreLedger>,
}

/// Result of a completed answer exchange.
#[derive(Debug)]
pub struct AnswerOutcome {
    pub transcript: String,
    pub feedback: String,
    pub score: Score,
    /// Set when the score could not be written to the ledger.
    pub persistence_error: Option<SessionError>,
}

/// The protocol state machine for one connection.
///
/// `IDLE` (no pending question) moves to `QUESTION_SERVED` when a question is
/// delivered, and back to `IDLE` once an answer has been handled, whether it
/// succeeded or not.
pub struct QuizSession {
    session: Session,
    deps: Collaborators,
    config: SessionConfig,
}

impl QuizSession {
    pub fn new(identity: Identity, deps: Collaborators, config: SessionConfig) -> Self {
        Self {
            session: Session::new(identity),
            deps,
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Handles one decoded message and builds the reply for it.
    pub async fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::RequestQuestion { ordinal } => match self.request_question(ordinal).await {
                Ok(question) => ServerMessage::Question {
                    question: question.text.clone(),
                },
                Err(e) => reject(&e),
            },
            ClientMessage::SubmitAnswer { audio } => match self.submit_answer(audio).await {
                Ok(outcome) => ServerMessage::Evaluated {
                    transcribed_answer: outcome.transcript,
                    evaluation: outcome.feedback,
                    final_score: outcome.score.value(),
                    error: outcome.persistence_error.as_ref().map(ErrorBody::from),
                },
                Err(e) => reject(&e),
            },
            // Undecodable frames never touch the session state; a pending
            // question stays pending.
            ClientMessage::Invalid { reason } => reject(&SessionError::ProtocolViolation(reason)),
        }
    }

    /// Serves the question at `ordinal`, replacing any question still pending.
    ///
    /// On failure the session is left exactly as it was.
    pub async fn request_question(&mut self, ordinal: u32) -> Result<&Question, SessionError> {
        let store = Arc::clone(&self.deps.questions);
        let identity = self.session.identity.clone();
        let fetched = tokio::time::timeout(
            self.config.question_timeout,
            store.fetch_question(&identity, ordinal),
        )
        .await
        .map_err(|_| {
            SessionError::QuestionStore(anyhow!(
                "timed out after {:?}",
                self.config.question_timeout
            ))
        })?
        .map_err(SessionError::QuestionStore)?;

        let question = fetched.ok_or(SessionError::NotFound { ordinal })?;
        if self.session.awaiting == Awaiting::AnswerPending {
            debug!(ordinal, "New question supersedes the pending one");
        }
        info!(ordinal, question_id = question.id, "Serving question");
        Ok(self.session.serve(question))
    }

    /// Transcribes, evaluates, scores and records an answer to the pending
    /// question.
    ///
    /// The stages run strictly one after another, and the first failure ends
    /// the exchange with that stage's error. Persistence is the exception: by
    /// then the answer has a valid score, so a failed ledger write is handed
    /// back inside the outcome instead of replacing it.
    pub async fn submit_answer(&mut self, audio: Vec<u8>) -> Result<AnswerOutcome, SessionError> {
        // Whatever happens below, the session is idle again afterwards.
        let question = self.session.take_pending().ok_or_else(|| {
            SessionError::protocol("no question is awaiting an answer; request a question first")
        })?;

        if audio.is_empty() {
            return Err(SessionError::Transcription(anyhow!("audio payload is empty")));
        }

        let deps = self.deps.clone();
        let attempts = self.config.max_attempts;

        let transcript = call_with_retry(
            "transcription",
            self.config.transcription_timeout,
            attempts,
            || deps.transcriber.transcribe(&audio),
        )
        .await
        .map_err(SessionError::Transcription)?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(SessionError::Transcription(anyhow!(
                "transcription produced no text"
            )));
        }
        debug!(%transcript, "Answer transcribed");

        let feedback = call_with_retry(
            "evaluation",
            self.config.evaluation_timeout,
            attempts,
            || deps.evaluator.evaluate(&question.text, &transcript),
        )
        .await
        .map_err(SessionError::Evaluation)?;
        if feedback.trim().is_empty() {
            return Err(SessionError::Evaluation(anyhow!(
                "evaluator returned no feedback"
            )));
        }

        let score = parse_score(&feedback).inspect_err(|e| {
            warn!(error = %e, %feedback, "Could not extract a score from the evaluation");
        })?;

        let record = EvaluationRecord::new(
            self.session.identity.clone(),
            &question,
            transcript,
            feedback,
            score,
        );
        let persistence_error = call_with_retry(
            "persistence",
            self.config.persistence_timeout,
            attempts,
            || deps.ledger.persist(&record),
        )
        .await
        .map_err(SessionError::Persistence)
        .err();

        match &persistence_error {
            None => info!(
                question_id = question.id,
                %score,
                record_id = %record.record_id,
                "Answer scored and recorded"
            ),
            Some(e) => warn!(
                question_id = question.id,
                %score,
                record_id = %record.record_id,
                error = %e,
                "Answer scored but not recorded"
            ),
        }

        Ok(AnswerOutcome {
            transcript: record.transcript,
            feedback: record.feedback,
            score,
            persistence_error,
        })
    }
}

fn reject(err: &SessionError) -> ServerMessage {
    debug!(kind = ?err.kind(), error = %err, "Request failed");
    ServerMessage::from(err)
}

// Every external call a session makes goes through here. Each attempt gets
// its own timeout, and a timed-out attempt counts as a failure just like an
// `Err` from the adapter, so a stalled service costs at most
// `attempts * limit` before the stage gives up.
//
// `call` is a closure rather than a future because each attempt needs a fresh
// future; a future that has been polled to a timeout cannot be restarted. For
// persistence the closure borrows the same `EvaluationRecord` every time, which
// is what lets the ledger recognise a retried write by its `record_id`.
async fn call_with_retry<T, F, Fut>(
    stage: &'static str,
    limit: Duration,
    attempts: u32,
    mut call: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match tokio::time::timeout(limit, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => anyhow!("{stage} timed out after {limit:?}"),
        };
        if attempt >= attempts {
            return Err(error);
        }
        warn!(stage, attempt, error = %format!("{error:#}"), "Adapter call failed, retrying");
        attempt += 1;
    }
}

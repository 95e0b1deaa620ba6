use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The authenticated user a session belongs to.
///
/// Produced by a `CredentialValidator` and never changed for the lifetime of a
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A quiz question as stored for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub ordinal: u32,
    pub text: String,
}

/// An answer score on the 0-10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    pub const MAX: u8 = 10;

    /// Returns `None` when `value` is above [`Score::MAX`].
    pub fn new(value: u32) -> Option<Self> {
        u8::try_from(value)
            .ok()
            .filter(|v| *v <= Self::MAX)
            .map(Self)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, Self::MAX)
    }
}

/// One completed answer exchange, as handed to the score ledger.
///
/// `record_id` is minted once per answer submission. Ledgers use it to make
/// repeated writes of the same record a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationRecord {
    pub record_id: Uuid,
    pub identity: Identity,
    pub question_id: i64,
    pub ordinal: u32,
    pub transcript: String,
    pub feedback: String,
    pub score: Score,
    pub created_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(
        identity: Identity,
        question: &Question,
        transcript: String,
        feedback: String,
        score: Score,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            identity,
            question_id: question.id,
            ordinal: question.ordinal,
            transcript,
            feedback,
            score,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_accepts_only_zero_to_ten() {
        assert_eq!(Score::new(0).map(Score::value), Some(0));
        assert_eq!(Score::new(10).map(Score::value), Some(10));
        assert!(Score::new(11).is_none());
        assert!(Score::new(300).is_none());
    }

    #[test]
    fn records_get_distinct_ids() {
        let question = Question {
            id: 7,
            ordinal: 2,
            text: "What is a heap?".to_string(),
        };
        let score = Score::new(6).unwrap();
        let a = EvaluationRecord::new("alice".into(), &question, "t".into(), "f".into(), score);
        let b = EvaluationRecord::new("alice".into(), &question, "t".into(), "f".into(), score);

        assert_ne!(a.record_id, b.record_id);
        assert_eq!(a.question_id, 7);
        assert_eq!(a.ordinal, 2);
    }
}

//! Extraction of the numeric score from an evaluator's free-text feedback.
//!
//! The evaluator is asked to start its reply with `Score: N/10`. Only the
//! first labeled score token is considered, and anything that is not a whole
//! number between 0 and 10 is an error rather than a guess.

use crate::types::Score;
use regex::Regex;
use std::sync::LazyLock;

/// `score` label, `:` or `=` (markdown emphasis around either side is
/// tolerated), a number, and an optional `/denominator`.
static SCORE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\b[\s*_]*[:=][\s*_]*(\d+(?:\.\d+)?)(?:\s*/\s*(\d+(?:\.\d+)?))?")
        .expect("score token pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreParseError {
    #[error("evaluation contains no `Score: N/10` token")]
    Missing,
    #[error("score `{0}` is not a whole number")]
    NotWholeNumber(String),
    #[error("score `{0}` is outside the range 0-10")]
    OutOfRange(String),
    #[error("score is given out of {0}, expected out of 10")]
    WrongScale(String),
}

/// Finds the score in `feedback`.
pub fn parse_score(feedback: &str) -> Result<Score, ScoreParseError> {
    let captures = SCORE_TOKEN
        .captures(feedback)
        .ok_or(ScoreParseError::Missing)?;

    if let Some(scale) = captures.get(2) {
        if scale.as_str() != "10" {
            return Err(ScoreParseError::WrongScale(scale.as_str().to_string()));
        }
    }

    // Group 1 always participates in a match.
    let raw = captures.get(1).map_or("", |m| m.as_str());
    if raw.contains('.') {
        return Err(ScoreParseError::NotWholeNumber(raw.to_string()));
    }
    raw.parse::<u32>()
        .ok()
        .and_then(Score::new)
        .ok_or_else(|| ScoreParseError::OutOfRange(raw.to_string()))
}

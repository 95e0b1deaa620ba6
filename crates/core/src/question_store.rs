use crate::types::{Identity, Question};
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Read access to each identity's question set, plus the write used when a
/// question bank is (re)loaded.
///
/// `fetch_question` returns `Ok(None)` when the identity has no question at
/// that ordinal. `Err` is reserved for the store itself failing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn fetch_question(&self, identity: &Identity, ordinal: u32) -> Result<Option<Question>>;

    /// Replaces the identity's whole question set. Ordinals follow the order
    /// of `texts`, starting at 0.
    async fn replace_questions(&self, identity: &Identity, texts: &[String])
    -> Result<Vec<Question>>;
}

/// Process-local question store, used when no database is configured.
#[derive(Default)]
pub struct MemoryQuestionStore {
    banks: RwLock<HashMap<Identity, Vec<Question>>>,
    next_id: AtomicI64,
}

impl MemoryQuestionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn question_count(&self, identity: &Identity) -> usize {
        self.banks.read().await.get(identity).map_or(0, Vec::len)
    }
}

#[async_trait]
impl QuestionStore for MemoryQuestionStore {
    async fn fetch_question(&self, identity: &Identity, ordinal: u32) -> Result<Option<Question>> {
        let banks = self.banks.read().await;
        Ok(banks
            .get(identity)
            .and_then(|bank| bank.get(ordinal as usize))
            .cloned())
    }

    async fn replace_questions(
        &self,
        identity: &Identity,
        texts: &[String],
    ) -> Result<Vec<Question>> {
        let questions: Vec<Question> = texts
            .iter()
            .enumerate()
            .map(|(ordinal, text)| {
                Ok(Question {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    ordinal: u32::try_from(ordinal)?,
                    text: text.clone(),
                })
            })
            .collect::<Result<_>>()?;

        self.banks
            .write()
            .await
            .insert(identity.clone(), questions.clone());
        Ok(questions)
    }
}

use crate::types::EvaluationRecord;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;

// The ledger is the only adapter the session writes to, and the only one whose
// retries have side effects. A write that times out may still have landed, so
// the session retries with the very same record and relies on the contract
// below to keep it from being stored twice.

/// Durable store of completed answer evaluations.
///
/// Writing a record whose `record_id` is already stored must succeed without
/// storing it again, so callers may retry a write whose outcome is unknown.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScoreLedger: Send + Sync {
    async fn persist(&self, record: &EvaluationRecord) -> Result<()>;
}

/// Process-local ledger, used when no database is configured.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<EvaluationRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far, oldest first.
    pub async fn records(&self) -> Vec<EvaluationRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ScoreLedger for MemoryLedger {
    async fn persist(&self, record: &EvaluationRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.iter().all(|r| r.record_id != record.record_id) {
            records.push(record.clone());
        }
        Ok(())
    }
}

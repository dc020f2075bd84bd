//! Dead-letter handling.
//!
//! Events that cannot be published, decoded, transformed or written are
//! recorded here and the pipeline moves on. `DeadLetterQueue` buffers records
//! and flushes them as NDJSON objects; without a configured path the records
//! are only logged.

mod queue;
mod types;

pub use queue::DeadLetterQueue;
pub use types::{DeadLetterRecord, FailureStage, FailureStats};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::error;

use crate::emit;
use crate::error::DlqError;
use crate::metrics::events::DeadLettered;

pub type DeadLetterSinkRef = Arc<dyn DeadLetterSink>;

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record one failed event. Append-only.
    async fn append(&self, record: DeadLetterRecord) -> Result<(), DlqError>;

    /// Persist anything still buffered.
    async fn flush(&self) -> Result<(), DlqError> {
        Ok(())
    }

    fn stats(&self) -> FailureStats;
}

/// Logs each record at error level and keeps counts.
pub struct LoggingDeadLetterSink {
    target: String,
    stats: Mutex<FailureStats>,
}

impl LoggingDeadLetterSink {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            stats: Mutex::new(FailureStats::default()),
        }
    }
}

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn append(&self, record: DeadLetterRecord) -> Result<(), DlqError> {
        error!(
            target = %self.target,
            stage = record.stage.as_str(),
            error = %record.error_message,
            payload = %record.original_payload,
            "Dead letter"
        );
        self.stats.lock().increment(record.stage);
        emit!(DeadLettered {
            stage: record.stage,
            target: self.target.clone(),
        });
        Ok(())
    }

    fn stats(&self) -> FailureStats {
        self.stats.lock().clone()
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn append(&self, record: DeadLetterRecord) -> Result<(), DlqError> {
        self.records.lock().push(record);
        Ok(())
    }

    fn stats(&self) -> FailureStats {
        let mut stats = FailureStats::default();
        for record in self.records.lock().iter() {
            stats.increment(record.stage);
        }
        stats
    }
}

/// Build the sink described by `config`: a storage-backed queue when a path
/// is set, otherwise a logging sink.
pub async fn sink_from_config(
    config: &crate::config::ErrorHandlingConfig,
    target: &str,
) -> Result<DeadLetterSinkRef, DlqError> {
    Ok(match DeadLetterQueue::from_config(config, target).await? {
        Some(queue) => Arc::new(queue),
        None => Arc::new(LoggingDeadLetterSink::new(target)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorHandlingConfig;

    #[tokio::test]
    async fn test_memory_sink_keeps_records_in_order() {
        let sink = MemoryDeadLetterSink::new();
        sink.append(DeadLetterRecord::new("a", "boom", FailureStage::Decode))
            .await
            .unwrap();
        sink.append(DeadLetterRecord::new("b", "boom", FailureStage::Write))
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_payload, "a");
        assert_eq!(sink.stats().write, 1);
    }

    #[tokio::test]
    async fn test_sink_without_path_logs_only() {
        let sink = sink_from_config(&ErrorHandlingConfig::default(), "orders")
            .await
            .unwrap();
        sink.append(DeadLetterRecord::new("{}", "nope", FailureStage::Publish))
            .await
            .unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.stats().publish, 1);
    }
}

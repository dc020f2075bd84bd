//! Storage-backed dead-letter queue.
//!
//! Records are buffered and flushed as NDJSON. Every flush writes its own
//! object so earlier flushes are never overwritten.

use bytes::Bytes;
use chrono::Utc;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use async_trait::async_trait;

use super::DeadLetterSink;
use super::types::{DeadLetterRecord, FailureStats};
use crate::config::ErrorHandlingConfig;
use crate::emit;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::metrics::events::DeadLettered;
use crate::storage::{StorageProvider, StorageProviderRef};

pub struct DeadLetterQueue {
    storage: StorageProviderRef,
    target: String,
    run_id: String,
    flush_seq: AtomicU64,
    buffer: Mutex<Vec<DeadLetterRecord>>,
    stats: parking_lot::Mutex<FailureStats>,
    buffer_size: usize,
}

impl DeadLetterQueue {
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(
        config: &ErrorHandlingConfig,
        target: &str,
    ) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!(target = %target, "DLQ enabled: {}", dlq_path);
        Ok(Some(Self::new(
            Arc::new(storage),
            target,
            config.dlq_buffer_size,
        )))
    }

    pub fn new(storage: StorageProviderRef, target: &str, buffer_size: usize) -> Self {
        Self {
            storage,
            target: target.to_string(),
            run_id: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            flush_seq: AtomicU64::new(0),
            buffer: Mutex::new(Vec::new()),
            stats: parking_lot::Mutex::new(FailureStats::default()),
            buffer_size: buffer_size.max(1),
        }
    }

    fn next_path(&self) -> Path {
        let seq = self.flush_seq.fetch_add(1, Ordering::SeqCst);
        Path::from(format!(
            "{}/failures-{}-{seq:05}.ndjson",
            self.target, self.run_id
        ))
    }

    /// Flush, then log the per-stage totals.
    pub async fn finalize(&self) -> Result<(), DlqError> {
        self.flush().await?;
        let stats = self.stats.lock().clone();
        info!(
            target = %self.target,
            "DLQ finalized: {} total failures (publish={}, circuit_open={}, decode={}, transform={}, write={})",
            stats.total(),
            stats.publish,
            stats.circuit_open,
            stats.decode,
            stats.transform,
            stats.write
        );
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn append(&self, record: DeadLetterRecord) -> Result<(), DlqError> {
        debug!(
            target = %self.target,
            stage = record.stage.as_str(),
            "Recording dead letter"
        );
        self.stats.lock().increment(record.stage);
        emit!(DeadLettered {
            stage: record.stage,
            target: self.target.clone(),
        });

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record);
            buffer.len() >= self.buffer_size
        };

        if should_flush && let Err(e) = self.flush().await {
            error!(target = %self.target, error = %e, "Failed to flush DLQ");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), DlqError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut ndjson = String::new();
        for record in buffer.iter() {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let path = self.next_path();
        self.storage
            .put_payload(&path, PutPayload::from(Bytes::from(ndjson)))
            .await
            .context(DlqWriteSnafu)?;

        // Only drop records once they are durable.
        info!(target = %self.target, "Flushed {} records to DLQ at {}", buffer.len(), path);
        buffer.clear();
        Ok(())
    }

    fn stats(&self) -> FailureStats {
        self.stats.lock().clone()
    }
}

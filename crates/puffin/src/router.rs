//! Per-message routing to the raw archive, the typed writer and the DLQ.
//!
//! The raw archive and the typed path are independent: a message that fails
//! to transform is still archived, and a raw write failure does not stop the
//! typed record. Failures of one message never affect the next.

use std::sync::Arc;

use freshet_core::bus::BusMessage;
use freshet_core::emit;
use freshet_core::metrics::events::{DeadLettered, EventSkipped, RecordTransformed};
use freshet_core::{DeadLetterRecord, DeadLetterSinkRef, FailureStage, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, WriterError};
use crate::sink::{RawSink, RecordSink};
use crate::transform::{SkipReason, TransformOutcome, Transformer, transform_with};

/// What happened to one message on one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Object written under this key.
    Written(String),
    Skipped(SkipReason),
    DeadLettered(FailureStage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// `None` when no raw destination is configured.
    pub raw: Option<Disposition>,
    /// `None` when no typed destination is configured.
    pub typed: Option<Disposition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages: u64,
    pub raw_written: u64,
    pub records_written: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
}

pub struct Router {
    transformer: Transformer,
    raw: Option<Arc<dyn RawSink>>,
    typed: Option<Arc<dyn RecordSink>>,
    dlq: DeadLetterSinkRef,
    write_retry: RetryPolicy,
    shutdown: CancellationToken,
    stats: RouterStats,
    target: String,
}

impl Router {
    pub fn new(
        transformer: Transformer,
        dlq: DeadLetterSinkRef,
        write_retry: RetryPolicy,
        shutdown: CancellationToken,
        target: impl Into<String>,
    ) -> Self {
        Self {
            transformer,
            raw: None,
            typed: None,
            dlq,
            write_retry,
            shutdown,
            stats: RouterStats::default(),
            target: target.into(),
        }
    }

    pub fn with_raw(mut self, sink: Arc<dyn RawSink>) -> Self {
        self.raw = Some(sink);
        self
    }

    pub fn with_typed(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.typed = Some(sink);
        self
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn dlq(&self) -> &DeadLetterSinkRef {
        &self.dlq
    }

    /// Route one message. Errors mean the message was not fully handled and
    /// must not be acknowledged: a dead letter could not be stored, or
    /// shutdown interrupted a write.
    pub async fn route(&mut self, message: &BusMessage) -> Result<RouteReport, PipelineError> {
        self.stats.messages += 1;
        let mut report = RouteReport::default();

        if let Some(raw) = self.raw.clone() {
            let written = self.write_with_retry(|| raw.write_raw(message)).await?;
            report.raw = Some(match written {
                Ok(key) => {
                    self.stats.raw_written += 1;
                    Disposition::Written(key)
                }
                Err(e) => self.write_failed(message, e).await?,
            });
        }

        if let Some(typed) = self.typed.clone() {
            report.typed = Some(self.route_typed(message, typed).await?);
        }
        Ok(report)
    }

    async fn route_typed(
        &mut self,
        message: &BusMessage,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Disposition, PipelineError> {
        // One snapshot for both transform and write so schema and record agree.
        let snapshot = self.transformer.registry().snapshot();

        let record = match transform_with(&snapshot, message) {
            TransformOutcome::Routed(record) => record,
            TransformOutcome::Skipped(reason) => {
                self.stats.skipped += 1;
                emit!(EventSkipped {
                    target: self.target.clone(),
                });
                debug!(
                    target = %self.target,
                    message = %message.id,
                    reason = reason.as_str(),
                    "[route] Skipped message"
                );
                return Ok(Disposition::Skipped(reason));
            }
            TransformOutcome::DeadLetter(record) => {
                warn!(
                    target = %self.target,
                    message = %message.id,
                    stage = record.stage.as_str(),
                    "[route] Dead-lettering message: {}",
                    record.error_message
                );
                return self.dead_letter(record).await;
            }
        };

        emit!(RecordTransformed {
            collection: record.collection.clone(),
            target: self.target.clone(),
        });
        let Some(registered) = snapshot.get(&record.collection) else {
            return Ok(Disposition::Skipped(SkipReason::Unregistered));
        };

        let written = self
            .write_with_retry(|| sink.write_record(&record, &registered.schema))
            .await?;
        match written {
            Ok(key) => {
                self.stats.records_written += 1;
                Ok(Disposition::Written(key))
            }
            Err(e) => self.write_failed(message, e).await,
        }
    }

    /// Retry `write` under the write policy. The outer error is shutdown;
    /// the inner one is the last write failure.
    async fn write_with_retry<F, Fut>(
        &self,
        mut write: F,
    ) -> Result<Result<String, WriterError>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, WriterError>>,
    {
        let mut attempt = 1;
        loop {
            let error = match write().await {
                Ok(key) => return Ok(Ok(key)),
                Err(e) => e,
            };
            if !self.write_retry.allows_attempt(attempt + 1) {
                return Ok(Err(error));
            }
            debug!(
                target = %self.target,
                attempt,
                "[route] Write failed, retrying: {error}"
            );
            if !self.write_retry.wait(attempt, &self.shutdown).await {
                return Err(PipelineError::Interrupted);
            }
            attempt += 1;
        }
    }

    async fn write_failed(
        &mut self,
        message: &BusMessage,
        error: WriterError,
    ) -> Result<Disposition, PipelineError> {
        warn!(
            target = %self.target,
            message = %message.id,
            "[route] Write failed after retries: {error}"
        );
        let record = DeadLetterRecord::new(
            String::from_utf8_lossy(&message.payload),
            error.to_string(),
            FailureStage::Write,
        );
        self.dead_letter(record).await
    }

    async fn dead_letter(&mut self, record: DeadLetterRecord) -> Result<Disposition, PipelineError> {
        let stage = record.stage;
        self.dlq.append(record).await?;
        self.stats.dead_lettered += 1;
        emit!(DeadLettered {
            stage,
            target: self.target.clone(),
        });
        Ok(Disposition::DeadLettered(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionDefinitions, CollectionSchema, RegistrySource, SchemaRegistry};
    use crate::transform::TransformedRecord;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use freshet_core::{DeadLetterSink, MemoryDeadLetterSink, StorageError};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Record sink that fails a configurable number of times first.
    #[derive(Default)]
    struct FlakySink {
        failures_left: Mutex<u32>,
        written: Mutex<Vec<String>>,
    }

    impl FlakySink {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                written: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl RecordSink for FlakySink {
        async fn write_record(
            &self,
            record: &TransformedRecord,
            _schema: &CollectionSchema,
        ) -> Result<String, WriterError> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(WriterError::WriteObject {
                        path: record.message_id.clone(),
                        source: StorageError::InvalidUrl {
                            url: "memory://".into(),
                            message: "injected".into(),
                        },
                    });
                }
            }
            self.written.lock().push(record.message_id.clone());
            Ok(record.message_id.clone())
        }
    }

    fn transformer() -> Transformer {
        let definitions: CollectionDefinitions = serde_yaml::from_str(
            "customers:\n  fields:\n    - { name: pk_client, type: string, nullable: false, from: _id }\n",
        )
        .unwrap();
        Transformer::new(Arc::new(
            SchemaRegistry::load(RegistrySource::inline(definitions), "test").unwrap(),
        ))
    }

    fn message(value: serde_json::Value) -> BusMessage {
        BusMessage {
            id: "m-1".into(),
            topic: "cdc-events".into(),
            ordering_key: "customers".into(),
            payload: Bytes::from(serde_json::to_vec(&value).unwrap()),
            published_at: Utc::now(),
        }
    }

    fn router(sink: Arc<FlakySink>, dlq: Arc<MemoryDeadLetterSink>, retries: u32) -> Router {
        Router::new(
            transformer(),
            dlq,
            RetryPolicy::immediate(retries),
            CancellationToken::new(),
            "test",
        )
        .with_typed(sink)
    }

    #[tokio::test]
    async fn test_write_retried_until_success() {
        let sink = Arc::new(FlakySink::failing(2));
        let dlq = Arc::new(MemoryDeadLetterSink::new());
        let mut router = router(sink.clone(), dlq.clone(), 3);

        let report = router
            .route(&message(json!({
                "operation": "insert", "collection": "customers",
                "document": {"_id": "c1"}, "token": 9
            })))
            .await
            .unwrap();

        assert_eq!(report.typed, Some(Disposition::Written("9".into())));
        assert_eq!(report.raw, None);
        assert_eq!(*sink.written.lock(), vec!["9".to_string()]);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_write_is_dead_lettered() {
        let sink = Arc::new(FlakySink::failing(5));
        let dlq = Arc::new(MemoryDeadLetterSink::new());
        let mut router = router(sink, dlq.clone(), 2);

        let report = router
            .route(&message(json!({
                "operation": "insert", "collection": "customers", "document": {"_id": "c1"}
            })))
            .await
            .unwrap();

        assert_eq!(report.typed, Some(Disposition::DeadLettered(FailureStage::Write)));
        let records = dlq.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, FailureStage::Write);
        assert!(records[0].original_payload.contains("\"c1\""));
        assert_eq!(router.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_affect_next() {
        let sink = Arc::new(FlakySink::default());
        let dlq = Arc::new(MemoryDeadLetterSink::new());
        let mut router = router(sink.clone(), dlq.clone(), 1);

        let bad = BusMessage {
            payload: Bytes::from_static(b"\x00garbage"),
            ..message(json!({}))
        };
        let first = router.route(&bad).await.unwrap();
        let second = router
            .route(&message(json!({
                "operation": "update", "collection": "customers",
                "document": {"_id": "c2"}, "token": 10
            })))
            .await
            .unwrap();

        assert_eq!(first.typed, Some(Disposition::DeadLettered(FailureStage::Decode)));
        assert_eq!(second.typed, Some(Disposition::Written("10".into())));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.stats().total(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retry_wait() {
        let sink = Arc::new(FlakySink::failing(5));
        let dlq = Arc::new(MemoryDeadLetterSink::new());
        let shutdown = CancellationToken::new();
        let mut router = Router::new(
            transformer(),
            dlq.clone(),
            RetryPolicy::new(5, std::time::Duration::from_secs(60), std::time::Duration::from_secs(60)),
            shutdown.clone(),
            "test",
        )
        .with_typed(sink);
        shutdown.cancel();

        let result = router
            .route(&message(json!({
                "operation": "insert", "collection": "customers", "document": {"_id": "c1"}
            })))
            .await;

        assert!(matches!(result, Err(PipelineError::Interrupted)));
        assert!(dlq.is_empty());
    }
}

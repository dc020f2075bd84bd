//! A single publisher worker.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use freshet_core::emit;
use freshet_core::error::BusError;
use freshet_core::metrics::events::{
    EventPublished, PublishAttemptFailed, PublishDuration, PublishOutcome,
};
use freshet_core::{ChangeEvent, ChangeMessage, DeadLetterRecord, FailureStage};

use super::{PublishStats, PublisherShared};

pub struct PublishWorker {
    id: usize,
    shared: Arc<PublisherShared>,
}

impl PublishWorker {
    pub fn new(id: usize, shared: Arc<PublisherShared>) -> Self {
        Self { id, shared }
    }

    /// Publish until `shutdown` fires or the queue is closed and empty.
    pub async fn run(self, shutdown: CancellationToken) {
        let target = &self.shared.target;
        debug!(target = %target, worker = self.id, "[publish] Worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.shared.queue.dequeue() => item,
            };
            let Some(mut item) = item else {
                debug!(target = %target, worker = self.id, "[publish] Queue closed and drained");
                break;
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    PublishStats::bump(&self.shared.stats.abandoned);
                    break;
                }
                _ = item.turn.wait() => {}
            }

            let outcome = self.handle(&item.event, &shutdown).await;
            // Holding the turn until here keeps same-key publishes in order.
            drop(item);

            if outcome.is_none() {
                break;
            }
        }

        debug!(target = %target, worker = self.id, "[publish] Worker stopped");
    }

    /// Drive one event to an outcome. `None` means shutdown interrupted the
    /// retries and the event was left unacknowledged.
    async fn handle(&self, event: &ChangeEvent, shutdown: &CancellationToken) -> Option<PublishOutcome> {
        let shared = &self.shared;
        let payload = match ChangeMessage::from_event(event).to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                let record = DeadLetterRecord::new(
                    format!("{event:?}"),
                    format!("Failed to encode bus message: {e}"),
                    FailureStage::Publish,
                );
                return Some(self.dead_letter(event, record, PublishOutcome::DeadLettered).await);
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let Some(admission) = shared.breaker.try_acquire() else {
                let record = DeadLetterRecord::new(
                    String::from_utf8_lossy(&payload),
                    "Circuit breaker open, publish short-circuited",
                    FailureStage::CircuitOpen,
                );
                return Some(self.dead_letter(event, record, PublishOutcome::ShortCircuited).await);
            };

            // An attempt already started runs to completion or timeout.
            let result = self.publish_once(event, payload.clone()).await;

            match result {
                Ok(message_id) => {
                    shared.breaker.record_success(admission);
                    shared.tracker.ack(event.token);
                    PublishStats::bump(&shared.stats.published);
                    emit!(EventPublished {
                        outcome: PublishOutcome::Published,
                        target: shared.target.clone(),
                    });
                    debug!(
                        target = %shared.target,
                        token = %event.token,
                        message_id = %message_id,
                        "[publish] Published"
                    );
                    return Some(PublishOutcome::Published);
                }
                Err(e) => {
                    shared.breaker.record_failure(admission);
                    PublishStats::bump(&shared.stats.failed_attempts);
                    emit!(PublishAttemptFailed {
                        target: shared.target.clone(),
                    });

                    if !e.is_transient() || !shared.retry.allows_attempt(attempt + 1) {
                        let record = DeadLetterRecord::new(
                            String::from_utf8_lossy(&payload),
                            format!("Publish failed after {attempt} attempt(s): {e}"),
                            FailureStage::Publish,
                        );
                        return Some(self.dead_letter(event, record, PublishOutcome::DeadLettered).await);
                    }

                    warn!(
                        target = %shared.target,
                        token = %event.token,
                        attempt,
                        error = %e,
                        "[publish] Attempt failed, retrying"
                    );
                    if !shared.retry.wait(attempt, shutdown).await {
                        PublishStats::bump(&shared.stats.abandoned);
                        return None;
                    }
                }
            }
        }
    }

    /// One publish under the concurrency limits and the per-attempt timeout.
    async fn publish_once(&self, event: &ChangeEvent, payload: Bytes) -> Result<String, BusError> {
        let shared = &self.shared;

        let _global = match &shared.global_permits {
            Some(semaphore) => Some(semaphore.acquire().await.map_err(|_| BusError::Closed)?),
            None => None,
        };
        let _local = shared.permits.acquire().await.map_err(|_| BusError::Closed)?;

        let start = Instant::now();
        let result = tokio::time::timeout(
            shared.publish_timeout,
            shared.bus.publish(&shared.topic, payload, event.ordering_key()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BusError::PublishTimeout {
                topic: shared.topic.clone(),
                timeout_ms: shared.publish_timeout.as_millis() as u64,
            })
        });

        emit!(PublishDuration {
            duration: start.elapsed(),
            target: shared.target.clone(),
        });
        result
    }

    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        record: DeadLetterRecord,
        outcome: PublishOutcome,
    ) -> PublishOutcome {
        let shared = &self.shared;
        warn!(
            target = %shared.target,
            token = %event.token,
            collection = %event.collection,
            stage = record.stage.as_str(),
            error = %record.error_message,
            "[publish] Dead-lettering event"
        );
        if let Err(e) = shared.dlq.append(record).await {
            // Left unacknowledged so the checkpoint stays behind it and the
            // event is read again after a restart.
            error!(
                target = %shared.target,
                token = %event.token,
                error = %e,
                "[publish] Failed to record dead letter, event left unacknowledged"
            );
            PublishStats::bump(&shared.stats.abandoned);
            return outcome;
        }

        // Dead-lettered events count as handled for the checkpoint.
        shared.tracker.ack(event.token);
        let counter = match outcome {
            PublishOutcome::ShortCircuited => &shared.stats.short_circuited,
            _ => &shared.stats.dead_lettered,
        };
        PublishStats::bump(counter);
        emit!(EventPublished {
            outcome,
            target: shared.target.clone(),
        });
        outcome
    }
}

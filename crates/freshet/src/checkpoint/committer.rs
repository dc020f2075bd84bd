//! Periodic persistence of the no-gap watermark.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use freshet_core::emit;
use freshet_core::{DeadLetterSinkRef, ResumeToken};
use freshet_core::metrics::events::{CheckpointFailed, CheckpointLag, CheckpointSaved};

use super::CheckpointStore;
use crate::tracker::InFlightTracker;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub commits: u64,
    pub failures: u64,
    pub last_committed: Option<ResumeToken>,
}

/// Commits after `commit_every` acknowledgements or `interval`, whichever
/// comes first. A failed save is retried on the next trigger and never
/// blocks ingestion.
///
/// Dead-lettered events are acknowledged once they are appended to the
/// dead-letter sink, which may only buffer them. The sink is flushed before
/// every save so the checkpoint never passes a dead letter that is not
/// durable yet.
pub struct CheckpointCommitter {
    store: Arc<dyn CheckpointStore>,
    tracker: Arc<InFlightTracker>,
    dlq: DeadLetterSinkRef,
    key: String,
    commit_every: u64,
    interval: Duration,
    stats: CommitStats,
}

impl CheckpointCommitter {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        tracker: Arc<InFlightTracker>,
        dlq: DeadLetterSinkRef,
        key: impl Into<String>,
        commit_every: u64,
        interval: Duration,
        last_committed: Option<ResumeToken>,
    ) -> Self {
        Self {
            store,
            tracker,
            dlq,
            key: key.into(),
            commit_every: commit_every.max(1),
            interval,
            stats: CommitStats {
                last_committed,
                ..CommitStats::default()
            },
        }
    }

    /// Commit on every trigger until `stop` fires, then commit once more.
    pub async fn run(mut self, stop: CancellationToken) -> CommitStats {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(target = %self.key, "Commit interval elapsed");
                    self.commit().await;
                }
                _ = self.tracker.acknowledged() => {
                    if self.tracker.acked_since_commit() >= self.commit_every {
                        self.commit().await;
                        ticker.reset();
                    }
                }
            }
        }

        info!(target = %self.key, "Flushing final checkpoint");
        self.commit().await;
        self.stats
    }

    /// Persist the watermark if it moved past the last persisted token.
    ///
    /// Returns true when a new token was saved.
    pub async fn commit(&mut self) -> bool {
        let watermark = self.tracker.watermark();
        self.report_lag();

        let Some(token) = watermark else {
            return false;
        };
        if Some(token) <= self.stats.last_committed {
            self.tracker.reset_acked();
            return false;
        }

        if let Err(e) = self.dlq.flush().await {
            self.record_failure();
            warn!(
                target = %self.key,
                token = %token,
                error = %e,
                "Failed to flush dead letters, checkpoint not saved"
            );
            return false;
        }

        match self.store.put(&self.key, token).await {
            Ok(()) => {
                self.stats.commits += 1;
                self.stats.last_committed = Some(token);
                self.tracker.reset_acked();
                emit!(CheckpointSaved {
                    target: self.key.clone(),
                });
                debug!(target = %self.key, token = %token, "Checkpoint committed");
                self.report_lag();
                true
            }
            Err(e) => {
                self.record_failure();
                warn!(
                    target = %self.key,
                    token = %token,
                    error = %e,
                    "Failed to persist checkpoint, will retry on next trigger"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    fn record_failure(&mut self) {
        self.stats.failures += 1;
        emit!(CheckpointFailed {
            target: self.key.clone(),
        });
    }

    fn report_lag(&self) {
        let lag = self
            .tracker
            .last_registered()
            .map(|latest| latest.distance_from(self.stats.last_committed))
            .unwrap_or(0);
        emit!(CheckpointLag {
            events: lag,
            target: self.key.clone(),
        });
    }
}

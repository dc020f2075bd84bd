//! One ingestion pipeline: reader, queue, publisher pool and committer.

use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use freshet_core::{DeadLetterSinkRef, MessageBus, ResumeToken};

use crate::breaker::CircuitBreaker;
use crate::checkpoint::{CheckpointCommitter, CheckpointStore, CommitStats};
use crate::config::{PipelineConfig, PipelineKey};
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::publisher::{PublishStats, PublishSummary, PublishWorker, PublisherShared};
use crate::queue::EventQueue;
use crate::source::{ChangeFeed, ReaderStats, SourceReader};
use crate::tracker::InFlightTracker;

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub resumed_from: Option<ResumeToken>,
    pub reader: ReaderStats,
    pub publish: PublishSummary,
    pub commits: CommitStats,
}

pub struct Ingester {
    key: PipelineKey,
    config: PipelineConfig,
    feed: Arc<dyn ChangeFeed>,
    bus: Arc<dyn MessageBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    dlq: DeadLetterSinkRef,
    global_permits: Option<Arc<Semaphore>>,
}

impl Ingester {
    pub fn new(
        key: PipelineKey,
        config: PipelineConfig,
        feed: Arc<dyn ChangeFeed>,
        bus: Arc<dyn MessageBus>,
        checkpoints: Arc<dyn CheckpointStore>,
        dlq: DeadLetterSinkRef,
    ) -> Self {
        Self {
            key,
            config,
            feed,
            bus,
            checkpoints,
            dlq,
            global_permits: None,
        }
    }

    /// Share a process-wide publish limit with other pipelines.
    pub fn with_global_permits(mut self, permits: Option<Arc<Semaphore>>) -> Self {
        self.global_permits = permits;
        self
    }

    /// Run until `shutdown` fires or the reader gives up.
    ///
    /// On shutdown the workers stop first, then the committer flushes the
    /// final watermark, then the reader is halted. If the reader fails, the
    /// queue is drained and committed before the error is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<IngestReport, PipelineError> {
        let target = self.key.id().to_string();
        let config = &self.config;

        let start = self.checkpoints.get(&target).await?;
        info!(
            target = %target,
            from = ?start,
            workers = config.publisher.workers,
            topic = %config.bus.topic,
            "Starting ingester"
        );

        let tracker = Arc::new(InFlightTracker::new(start));
        let queue = Arc::new(EventQueue::new(
            config.queue.capacity,
            config.queue.high_watermark,
            config.queue.low_watermark,
            target.clone(),
        ));
        let shared = Arc::new(PublisherShared {
            queue: queue.clone(),
            tracker: tracker.clone(),
            breaker: Arc::new(CircuitBreaker::new(&config.breaker, target.clone())),
            bus: self.bus.clone(),
            dlq: self.dlq.clone(),
            topic: config.bus.topic.clone(),
            publish_timeout: config.publisher.publish_timeout(),
            retry: config.publisher.retry.clone(),
            permits: Arc::new(Semaphore::new(config.publisher.max_concurrent_publishes)),
            global_permits: self.global_permits.clone(),
            stats: PublishStats::default(),
            target: target.clone(),
        });

        let worker_stop = shutdown.child_token();
        let committer_stop = CancellationToken::new();
        let reader_stop = CancellationToken::new();

        let mut workers = JoinSet::new();
        for id in 0..config.publisher.workers {
            workers.spawn(PublishWorker::new(id, shared.clone()).run(worker_stop.clone()));
        }

        let mut committer = JoinSet::new();
        committer.spawn(
            CheckpointCommitter::new(
                self.checkpoints.clone(),
                tracker.clone(),
                self.dlq.clone(),
                target.clone(),
                config.checkpoint.commit_every_events,
                config.checkpoint.commit_interval(),
                start,
            )
            .run(committer_stop.clone()),
        );

        let mut reader = JoinSet::new();
        reader.spawn(
            SourceReader::new(
                self.feed.clone(),
                queue.clone(),
                tracker.clone(),
                &config.source,
                target.clone(),
            )
            .run(start, reader_stop.clone()),
        );

        let reader_exit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(target = %target, "Shutdown requested, stopping publisher workers");
                None
            }
            joined = reader.join_next() => Some(joined),
        };

        if reader_exit.is_some() {
            // Nothing more will arrive, let the workers finish what is queued.
            queue.close();
        }
        while let Some(joined) = workers.join_next().await {
            joined.context(TaskJoinSnafu)?;
        }

        if let Err(e) = self.dlq.flush().await {
            warn!(target = %target, error = %e, "Failed to flush dead letters");
        }

        committer_stop.cancel();
        let commits = match committer.join_next().await {
            Some(joined) => joined.context(TaskJoinSnafu)?,
            None => CommitStats::default(),
        };

        let reader_joined = match reader_exit {
            Some(joined) => joined,
            None => {
                reader_stop.cancel();
                reader.join_next().await
            }
        };
        let reader_stats = match reader_joined {
            Some(joined) => joined.context(TaskJoinSnafu)??,
            None => ReaderStats::default(),
        };

        let report = IngestReport {
            resumed_from: start,
            reader: reader_stats,
            publish: shared.stats.summary(),
            commits,
        };
        info!(
            target = %target,
            read = report.reader.events_read,
            published = report.publish.published,
            dead_lettered = report.publish.dead_lettered + report.publish.short_circuited,
            committed = ?report.commits.last_committed,
            "Ingester stopped"
        );
        Ok(report)
    }
}

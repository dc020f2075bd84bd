//! Publisher worker pool.
//!
//! Workers share one queue, one breaker and one bus. Each dequeued event ends
//! in exactly one of three ways: published, dead-lettered, or abandoned at
//! shutdown. The first two acknowledge the token. Abandoned events, and
//! dead letters the sink failed to store, are read again after a restart
//! because the checkpoint never passes them.

mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;

use freshet_core::{DeadLetterSinkRef, MessageBus, RetryPolicy};

use crate::breaker::CircuitBreaker;
use crate::queue::EventQueue;
use crate::tracker::InFlightTracker;

pub use worker::PublishWorker;

#[derive(Default)]
pub struct PublishStats {
    published: AtomicU64,
    dead_lettered: AtomicU64,
    short_circuited: AtomicU64,
    failed_attempts: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: u64,
    pub dead_lettered: u64,
    pub short_circuited: u64,
    pub failed_attempts: u64,
    pub abandoned: u64,
}

impl PublishStats {
    pub fn summary(&self) -> PublishSummary {
        PublishSummary {
            published: self.published.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct PublisherShared {
    pub queue: Arc<EventQueue>,
    pub tracker: Arc<InFlightTracker>,
    pub breaker: Arc<CircuitBreaker>,
    pub bus: Arc<dyn MessageBus>,
    pub dlq: DeadLetterSinkRef,
    pub topic: String,
    pub publish_timeout: Duration,
    pub retry: RetryPolicy,
    /// In-flight publishes for this pipeline.
    pub permits: Arc<Semaphore>,
    /// In-flight publishes across all pipelines of the process.
    pub global_permits: Option<Arc<Semaphore>>,
    pub stats: PublishStats,
    pub target: String,
}

//! Freshet: change-data-capture ingester.
//!
//! This crate handles:
//! - Reading an ordered change feed with reconnects and read timeouts
//! - Buffering events in a bounded queue with watermark backpressure
//! - Publishing to a message bus from a worker pool, in order per collection
//! - Short-circuiting publishes through a circuit breaker while the bus is down
//! - Committing the highest resume token with no unacknowledged event below it

pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod source;
pub mod tracker;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{FreshetPipeline, IngestReport, Ingester};

pub use freshet_core::{
    Application, ChangeEvent, MessageBus, Operation, ResumeToken, StorageProvider,
    StorageProviderRef,
};

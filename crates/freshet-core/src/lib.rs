//! freshet-core: plumbing shared by the freshet ingester and the puffin router.
//!
//! - `event` - change events, resume tokens and the bus envelope
//! - `bus` - message bus trait with in-memory and object-store implementations
//! - `dlq` - dead-letter records and sinks
//! - `retry` - bounded exponential backoff
//! - `storage` - multi-cloud object storage
//! - `config` - YAML loading, env interpolation, CLI arguments
//! - `metrics` - internal events and the Prometheus endpoint
//! - `topology`, `polling`, `app` - running components until shutdown

pub mod app;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod metrics;
pub mod polling;
pub mod retry;
pub mod signal;
pub mod storage;
pub mod topology;
pub mod tracing;

pub use app::{AppConfig, Application, Launch};
pub use bus::{BusMessage, MessageBus, Subscription};
pub use config::{
    CliArgs, ComponentKey, ErrorHandlingConfig, GlobalConfig, MetricsConfig, ParquetCompression,
};
pub use dlq::{
    DeadLetterQueue, DeadLetterRecord, DeadLetterSink, DeadLetterSinkRef, FailureStage,
    MemoryDeadLetterSink,
};
pub use error::{
    BusError, ConfigError, DlqError, MetricsError, PipelineSetupError, StorageError,
};
pub use event::{ChangeEvent, ChangeMessage, Operation, ResumeToken};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use retry::RetryPolicy;
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
pub use topology::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
pub use tracing::init_tracing;

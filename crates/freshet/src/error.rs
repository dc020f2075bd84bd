//! Error types for the freshet ingester.

use snafu::prelude::*;

pub use freshet_core::error::{BusError, ConfigError, DlqError, StorageError};

/// Failures reading the change feed. All of them are treated as a disconnect.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FeedError {
    #[snafu(display("Change feed disconnected: {message}"))]
    Disconnected { message: String },

    #[snafu(display("Change feed read timed out after {timeout_ms}ms"))]
    ReadTimeout { timeout_ms: u64 },

    #[snafu(display("Change feed storage error: {source}"))]
    FeedStorage { source: StorageError },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReaderError {
    /// The only fatal condition of the ingester.
    #[snafu(display("Gave up reconnecting to the change feed after {attempts} attempts: {source}"))]
    ReconnectsExhausted { attempts: u32, source: FeedError },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    #[snafu(display("Checkpoint storage error: {source}"))]
    CheckpointStorage { source: StorageError },

    #[snafu(display("Failed to serialize checkpoint: {source}"))]
    CheckpointSerialize { source: serde_json::Error },

    #[snafu(display("Checkpoint store unavailable: {message}"))]
    CheckpointUnavailable { message: String },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },

    #[snafu(display("Source reader failed: {source}"))]
    Reader { source: ReaderError },

    #[snafu(display("Failed to load checkpoint: {source}"))]
    Checkpoint { source: CheckpointError },

    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<DlqError> for PipelineError {
    fn from(source: DlqError) -> Self {
        PipelineError::Dlq { source }
    }
}

impl From<ReaderError> for PipelineError {
    fn from(source: ReaderError) -> Self {
        PipelineError::Reader { source }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(source: CheckpointError) -> Self {
        PipelineError::Checkpoint { source }
    }
}

//! Error types for the puffin router.

use std::path::PathBuf;

use deltalake::arrow::error::ArrowError;
use deltalake::parquet::errors::ParquetError;
use freshet_core::FailureStage;
use snafu::prelude::*;

pub use freshet_core::error::{BusError, ConfigError, DlqError, StorageError};

use crate::schema::ValueError;

/// Problems in a collection definition. A definition set with any of these
/// is never activated.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MappingError {
    #[snafu(display("{collection}.{field}: {message}"))]
    InvalidField {
        collection: String,
        field: String,
        message: String,
    },

    #[snafu(display("{collection}: field '{field}' is declared more than once"))]
    DuplicateField { collection: String, field: String },

    #[snafu(display("{collection}: no fields declared"))]
    EmptySchema { collection: String },

    #[snafu(display("Collection '{collection}' is defined more than once ({origin})"))]
    DuplicateCollection { collection: String, origin: String },

    #[snafu(display("Failed to read collection definitions from {}: {source}", path.display()))]
    ReadDefinitions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse collection definitions in {}: {source}", path.display()))]
    ParseDefinitions {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Invalid collection definitions:\n{}", errors.join("\n")))]
    InvalidDefinitions { errors: Vec<String> },
}

/// Why one bus message could not be turned into a record.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    #[snafu(display("Malformed event envelope: {source}"))]
    Envelope { source: serde_json::Error },

    #[snafu(display("Field '{field}': {source}"))]
    Field { field: String, source: ValueError },

    #[snafu(display("Field '{field}' is not nullable but resolved to null"))]
    NullValue { field: String },
}

impl TransformError {
    pub fn stage(&self) -> FailureStage {
        match self {
            TransformError::Envelope { .. } => FailureStage::Decode,
            TransformError::Field { .. } | TransformError::NullValue { .. } => {
                FailureStage::Transform
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WriterError {
    #[snafu(display("Failed to write {path}: {source}"))]
    WriteObject { path: String, source: StorageError },

    #[snafu(display("Column '{field}' cannot hold a {kind} value"))]
    ColumnType { field: String, kind: &'static str },

    #[snafu(display("Failed to build record batch: {source}"))]
    RecordBatch { source: ArrowError },

    #[snafu(display("Failed to encode parquet: {source}"))]
    ParquetEncode { source: ParquetError },
}

/// Top-level consumer errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },

    #[snafu(display("Bus error: {source}"))]
    Bus { source: BusError },

    #[snafu(display("Collection registry error: {source}"))]
    Mapping { source: MappingError },

    /// Shutdown arrived while a write was being retried.
    #[snafu(display("Interrupted by shutdown"))]
    Interrupted,
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

impl From<BusError> for PipelineError {
    fn from(source: BusError) -> Self {
        PipelineError::Bus { source }
    }
}

impl From<MappingError> for PipelineError {
    fn from(source: MappingError) -> Self {
        PipelineError::Mapping { source }
    }
}

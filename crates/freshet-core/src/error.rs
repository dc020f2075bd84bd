//! Error types shared by freshet and puffin.

use snafu::prelude::*;

// ============ Storage Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Storage URL could not be parsed or names an unsupported scheme.
    #[snafu(display("Invalid storage URL {url}: {message}"))]
    InvalidUrl { url: String, message: String },

    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },
}

impl StorageError {
    /// True for 404-style errors (missing object or key).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        )
    }
}

// ============ Config Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    #[snafu(display("Duplicate component keys: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Component key is not usable in object names or metric labels.
    #[snafu(display("Invalid component key '{key}': use only [A-Za-z0-9_.-]"))]
    InvalidKey { key: String },

    /// A component failed validation.
    #[snafu(display("{component}: {message}"))]
    Invalid { component: String, message: String },

    #[snafu(display("No components configured"))]
    NoComponents,

    #[snafu(display("No config files or directories specified"))]
    NoConfigSources,

    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,
}

// ============ Pipeline Setup Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineSetupError {
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    #[snafu(display("Failed to initialize metrics: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("{count} component(s) failed"))]
    ComponentsFailed { count: usize },
}

// ============ DLQ Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix avoids selector clashes such as `WriteSnafu`.
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Bus Errors ============

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BusError {
    /// The bus did not answer within the publish timeout.
    #[snafu(display("Publish to '{topic}' timed out after {timeout_ms}ms"))]
    PublishTimeout { topic: String, timeout_ms: u64 },

    /// The bus refused or failed the publish.
    #[snafu(display("Publish to '{topic}' failed: {message}"))]
    PublishRejected { topic: String, message: String },

    #[snafu(display("Bus storage error: {source}"))]
    BusStorage { source: StorageError },

    #[snafu(display("Malformed bus message {id}: {source}"))]
    MalformedMessage {
        id: String,
        source: serde_json::Error,
    },

    #[snafu(display("Bus is closed"))]
    Closed,
}

impl BusError {
    /// Failures worth retrying. A closed bus is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BusError::Closed | BusError::MalformedMessage { .. })
    }
}

//! Configuration types shared by freshet and puffin.

mod component_key;
mod global;
mod loader;
mod path;
mod vars;

pub use component_key::ComponentKey;
pub use global::GlobalConfig;
pub use loader::{Mergeable, load_from_paths};
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prometheus endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    pub fn merge_from(&mut self, other: Self) {
        if other.address != default_metrics_address() {
            self.address = other.address;
        }
    }
}

fn default_metrics_address() -> String {
    crate::metrics::DEFAULT_METRICS_ADDR.to_string()
}

/// Where dead-lettered events are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHandlingConfig {
    /// Storage URL for dead-letter files. Without it, dead letters are only logged.
    #[serde(default)]
    pub dlq_path: Option<String>,
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
    /// Records buffered before a flush to storage.
    #[serde(default = "default_dlq_buffer_size")]
    pub dlq_buffer_size: usize,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            dlq_path: None,
            dlq_storage_options: HashMap::new(),
            dlq_buffer_size: default_dlq_buffer_size(),
        }
    }
}

fn default_dlq_buffer_size() -> usize {
    100
}

/// Parquet compression codec for typed output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

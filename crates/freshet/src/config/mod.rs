//! Configuration for the freshet ingester.
//!
//! ```yaml
//! pipelines:
//!   orders:
//!     source:
//!       path: gs://cdc-export/orders
//!       collections: [orders, customers]
//!     bus:
//!       path: gs://cdc-bus
//!       topic: cdc-events
//!     checkpoint:
//!       path: gs://cdc-state
//!     publisher:
//!       workers: 10
//!
//! global:
//!   total_concurrency: 64
//! ```

mod pipeline_key;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use freshet_core::bus::StorageBusConfig;
pub use freshet_core::config::{
    ConfigPath, ErrorHandlingConfig, GlobalConfig, Mergeable, MetricsConfig, load_from_paths,
};
pub use freshet_core::retry::RetryPolicy;
pub use pipeline_key::PipelineKey;

use freshet_core::error::ConfigError;

/// Where change events are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// URL of the NDJSON change export.
    pub path: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Only events of these collections are published. Empty means all.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Pause between reads when the feed has nothing new.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryPolicy,
}

fn default_read_timeout() -> u64 {
    30
}

fn default_idle_poll() -> u64 {
    500
}

fn default_reconnect() -> RetryPolicy {
    RetryPolicy::new(10, Duration::from_secs(5), Duration::from_secs(60))
}

impl SourceConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Fill fraction at which the reader is paused.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// Fill fraction at which the reader resumes.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
}

fn default_capacity() -> usize {
    10_000
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_low_watermark() -> f64 {
    0.5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// In-flight publishes across this pipeline's workers.
    #[serde(default = "default_max_concurrent_publishes")]
    pub max_concurrent_publishes: usize,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_workers() -> usize {
    10
}

fn default_max_concurrent_publishes() -> usize {
    20
}

fn default_publish_timeout() -> u64 {
    5
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_concurrent_publishes: default_max_concurrent_publishes(),
            publish_timeout_secs: default_publish_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PublisherConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// URL under which `_freshet/{pipeline}_checkpoint.json` is kept.
    pub path: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default = "default_commit_every_events")]
    pub commit_every_events: u64,
    #[serde(default = "default_commit_interval")]
    pub commit_interval_secs: u64,
    /// Tokens older than this may have fallen out of the source's history.
    #[serde(default = "default_token_staleness")]
    pub token_staleness_hours: u64,
}

fn default_commit_every_events() -> u64 {
    1000
}

fn default_commit_interval() -> u64 {
    30
}

fn default_token_staleness() -> u64 {
    24
}

impl CheckpointConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn token_staleness(&self) -> Duration {
        Duration::from_secs(self.token_staleness_hours * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Failures within `window_secs` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Growth of the cooldown after each failed trial.
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
}

fn default_failure_threshold() -> u32 {
    100
}

fn default_window() -> u64 {
    300
}

fn default_cooldown() -> u64 {
    30
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown() -> u64 {
    600
}

fn default_half_open_trials() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window(),
            cooldown_secs: default_cooldown(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_secs: default_max_cooldown(),
            half_open_trials: default_half_open_trials(),
        }
    }
}

/// One source feeding one bus topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub bus: StorageBusConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

impl PipelineConfig {
    /// Every problem with this pipeline, as human-readable messages.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        check(!self.source.path.is_empty(), "source.path must not be empty");
        check(!self.bus.path.is_empty(), "bus.path must not be empty");
        check(!self.bus.topic.is_empty(), "bus.topic must not be empty");
        check(
            !self.checkpoint.path.is_empty(),
            "checkpoint.path must not be empty",
        );
        check(self.queue.capacity > 0, "queue.capacity must be positive");
        check(
            0.0 <= self.queue.low_watermark
                && self.queue.low_watermark < self.queue.high_watermark
                && self.queue.high_watermark <= 1.0,
            "queue watermarks must satisfy 0 <= low_watermark < high_watermark <= 1",
        );
        check(self.publisher.workers > 0, "publisher.workers must be positive");
        check(
            self.publisher.max_concurrent_publishes > 0,
            "publisher.max_concurrent_publishes must be positive",
        );
        check(
            self.publisher.publish_timeout_secs > 0,
            "publisher.publish_timeout_secs must be positive",
        );
        check(
            self.checkpoint.commit_every_events > 0,
            "checkpoint.commit_every_events must be positive",
        );
        check(
            self.breaker.failure_threshold > 0,
            "breaker.failure_threshold must be positive",
        );
        check(
            self.breaker.cooldown_multiplier >= 1.0,
            "breaker.cooldown_multiplier must be at least 1.0",
        );
        check(
            self.breaker.max_cooldown_secs >= self.breaker.cooldown_secs,
            "breaker.max_cooldown_secs must not be below breaker.cooldown_secs",
        );
        check(
            self.breaker.half_open_trials > 0,
            "breaker.half_open_trials must be positive",
        );
        problems
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pipelines: IndexMap<PipelineKey, PipelineConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Mergeable for Config {
    type Key = PipelineKey;
    type Component = PipelineConfig;

    fn components(&self) -> &IndexMap<PipelineKey, PipelineConfig> {
        &self.pipelines
    }

    fn components_mut(&mut self) -> &mut IndexMap<PipelineKey, PipelineConfig> {
        &mut self.pipelines
    }

    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }
}

impl Config {
    /// Load, merge and validate configuration from files and directories.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single YAML document, with environment interpolation.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let result = freshet_core::config::interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }
        let config = Self::parse_yaml(&result.text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipelines.is_empty() {
            return Err(ConfigError::NoComponents);
        }

        let mut errors = Vec::new();
        for (key, pipeline) in &self.pipelines {
            if !key.is_path_safe() {
                errors.push(ConfigError::InvalidKey {
                    key: key.to_string(),
                });
                continue;
            }
            errors.extend(pipeline.problems().into_iter().map(|message| {
                ConfigError::Invalid {
                    component: key.to_string(),
                    message,
                }
            }));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleErrors {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    pub fn pipelines(&self) -> impl Iterator<Item = (&PipelineKey, &PipelineConfig)> {
        self.pipelines.iter()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }
}

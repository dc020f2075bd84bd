//! Configuration for the puffin router.
//!
//! ```yaml
//! consumers:
//!   typed:
//!     subscription:
//!       path: gs://cdc-bus
//!       topic: cdc-events
//!     raw:
//!       path: gs://cdc-raw
//!     typed:
//!       path: gs://cdc-processed
//!       compression: zstd
//!     registry:
//!       path: /etc/puffin/collections
//!     error_handling:
//!       dlq_path: gs://cdc-dlq
//! ```

mod consumer_key;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use consumer_key::ConsumerKey;
pub use freshet_core::config::{
    ConfigPath, ErrorHandlingConfig, GlobalConfig, Mergeable, MetricsConfig, ParquetCompression,
    load_from_paths,
};
pub use freshet_core::retry::RetryPolicy;

use freshet_core::error::ConfigError;

use crate::mapping::CollectionDefinition;
use crate::schema::{RegistrySnapshot, RegistrySource};

/// The bus subscription a consumer reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Root URL of the bus spool.
    pub path: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Subscription name; defaults to the consumer key.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Must match the bus publishers' setting.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_topic() -> String {
    "cdc-events".to_string()
}

fn default_settle_ms() -> u64 {
    10_000
}

/// Raw archive destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDestinationConfig {
    pub path: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Typed Parquet destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypedDestinationConfig {
    pub path: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default)]
    pub compression: ParquetCompression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Directory of collection definition files.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Seconds between reloads of `path`. `0` disables reloading.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

fn default_reload_interval() -> u64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl RegistryConfig {
    /// `None` when hot reload is off or there is nothing to reload.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.path.is_some() && self.reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

/// One subscription feeding the raw and/or typed destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    pub subscription: SubscriptionConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Messages handled per poll; the subscription is committed after each batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub raw: Option<RawDestinationConfig>,
    #[serde(default)]
    pub typed: Option<TypedDestinationConfig>,
    #[serde(default)]
    pub write_retry: RetryPolicy,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Definitions given inline, merged with those in `registry.path`.
    #[serde(default)]
    pub collections: IndexMap<String, CollectionDefinition>,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

fn default_poll_interval() -> u64 {
    1
}

fn default_batch_size() -> usize {
    100
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn subscription_name<'a>(&'a self, key: &'a ConsumerKey) -> &'a str {
        self.subscription.name.as_deref().unwrap_or(key.id())
    }

    pub fn registry_source(&self) -> RegistrySource {
        RegistrySource {
            dir: self.registry.path.clone(),
            inline: self.collections.clone(),
        }
    }

    /// Every problem with this consumer, as human-readable messages.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        check(
            !self.subscription.path.is_empty(),
            "subscription.path must not be empty",
        );
        check(
            !self.subscription.topic.is_empty(),
            "subscription.topic must not be empty",
        );
        check(self.batch_size > 0, "batch_size must be positive");
        check(
            self.raw.is_some() || self.typed.is_some(),
            "at least one of raw and typed must be configured",
        );
        check(
            self.raw.as_ref().is_none_or(|raw| !raw.path.is_empty()),
            "raw.path must not be empty",
        );
        check(
            self.typed.as_ref().is_none_or(|typed| !typed.path.is_empty()),
            "typed.path must not be empty",
        );
        check(
            self.typed.is_none() || self.registry.path.is_some() || !self.collections.is_empty(),
            "typed output needs collection definitions (registry.path or collections)",
        );

        if self.typed.is_some() {
            let built = self
                .registry_source()
                .load()
                .and_then(|definitions| RegistrySnapshot::build(0, definitions));
            if let Err(e) = built {
                problems.push(e.to_string());
            }
        }
        problems
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub consumers: IndexMap<ConsumerKey, ConsumerConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Mergeable for Config {
    type Key = ConsumerKey;
    type Component = ConsumerConfig;

    fn components(&self) -> &IndexMap<ConsumerKey, ConsumerConfig> {
        &self.consumers
    }

    fn components_mut(&mut self) -> &mut IndexMap<ConsumerKey, ConsumerConfig> {
        &mut self.consumers
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
        if self.consumers.is_empty() {
            return Err(ConfigError::NoComponents);
        }

        let mut errors = Vec::new();
        for (key, consumer) in &self.consumers {
            if !key.is_path_safe() {
                errors.push(ConfigError::InvalidKey {
                    key: key.to_string(),
                });
                continue;
            }
            errors.extend(consumer.problems().into_iter().map(|message| {
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

    pub fn consumers(&self) -> impl Iterator<Item = (&ConsumerKey, &ConsumerConfig)> {
        self.consumers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
consumers:
  archive:
    subscription:
      path: /tmp/bus
    raw:
      path: /tmp/raw
"#;

    const TYPED: &str = r#"
consumers:
  typed:
    subscription:
      path: /tmp/bus
      name: typed-v2
    typed:
      path: /tmp/processed
      compression: zstd
    collections:
      customers:
        fields:
          - { name: pk_client, type: string, nullable: false, from: _id }
"#;

    #[test]
    fn test_minimal_consumer_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        let key = ConsumerKey::new("archive");
        let consumer = &config.consumers[&key];

        assert_eq!(consumer.subscription.topic, "cdc-events");
        assert_eq!(consumer.subscription.settle_ms, 10_000);
        assert_eq!(consumer.subscription_name(&key), "archive");
        assert_eq!(consumer.poll_interval(), Duration::from_secs(1));
        assert_eq!(consumer.batch_size, 100);
        assert_eq!(consumer.write_retry.max_attempts, 3);
        assert!(consumer.typed.is_none());
        assert_eq!(consumer.registry.reload_interval(), None);
    }

    #[test]
    fn test_typed_consumer_with_inline_collections() {
        let config = Config::parse(TYPED).unwrap();
        let key = ConsumerKey::new("typed");
        let consumer = &config.consumers[&key];

        assert_eq!(consumer.subscription_name(&key), "typed-v2");
        assert_eq!(
            consumer.typed.as_ref().unwrap().compression,
            ParquetCompression::Zstd
        );
        assert_eq!(consumer.collections.len(), 1);
    }

    #[test]
    fn test_consumer_without_destination_is_rejected() {
        let yaml = "consumers:\n  idle:\n    subscription:\n      path: /tmp/bus\n";
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one of raw and typed"));
    }

    #[test]
    fn test_invalid_collection_is_reported_at_load() {
        let yaml = TYPED.replace("nullable: false, from: _id", "from: _id, literal: x");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("customers.pk_client"));
    }

    #[test]
    fn test_registry_directory_is_validated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orders.yaml"),
            "orders:\n  fields:\n    - { name: total, type: \"decimal(2,3)\" }\n",
        )
        .unwrap();
        let yaml = format!(
            "{TYPED}    registry:\n      path: {}\n",
            dir.path().display()
        );
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = format!("{MINIMAL}    batchsize: 10\n");
        assert!(Config::parse(&yaml).is_err());
    }
}

//! Options shared by every component running in one process.

use serde::{Deserialize, Serialize};

/// Process-wide options, merged last-write-wins across config files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Cap on concurrent bus/storage operations across all components.
    #[serde(default)]
    pub total_concurrency: Option<usize>,
    /// Upper bound for the random delay added to component starts and polls.
    #[serde(default)]
    pub poll_jitter_secs: u64,
    /// How long shutdown may take before in-flight work is abandoned.
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

fn default_shutdown_grace_period() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            total_concurrency: None,
            poll_jitter_secs: 0,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl GlobalConfig {
    pub fn merge_from(&mut self, other: Self) {
        if other.total_concurrency.is_some() {
            self.total_concurrency = other.total_concurrency;
        }
        if other.poll_jitter_secs != 0 {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
        if other.shutdown_grace_period_secs != default_shutdown_grace_period() {
            self.shutdown_grace_period_secs = other.shutdown_grace_period_secs;
        }
    }
}

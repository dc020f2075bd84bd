//! Retry policy shared by feed reconnects, publishes and storage writes.
//!
//! The policy only answers two questions: may attempt `n` run, and how long
//! to wait after attempt `n` failed. Callers drive it from a plain loop and
//! pass their cancellation token to [`RetryPolicy::wait`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` means no limit.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Growth factor applied per failed attempt.
    pub multiplier: f64,
    /// Fraction of the delay (0.0..=1.0) randomized in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Policy with no sleeping, for tests and tight loops.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Whether 1-based `attempt` may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.is_unlimited() || attempt <= self.max_attempts
    }

    /// Delay after 1-based `attempt` failed, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay after 1-based `attempt` failed, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Sleep for the backoff after `attempt`. Returns `false` if cancelled first.
    pub async fn wait(&self, attempt: u32, shutdown: &CancellationToken) -> bool {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return !shutdown.is_cancelled();
        }
        shutdown
            .run_until_cancelled(tokio::time::sleep(delay))
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_attempt_limits() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));

        let unlimited = RetryPolicy::immediate(0);
        assert!(unlimited.allows_attempt(u32::MAX));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1_000), Duration::from_secs(10))
            .with_jitter(0.25);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[test]
    fn test_yaml_partial_override() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 7").unwrap();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_backoff_ms, 100);
    }

    #[tokio::test]
    async fn test_wait_returns_false_when_cancelled() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(30));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(!policy.wait(1, &shutdown).await);
    }

    #[tokio::test]
    async fn test_wait_immediate_policy() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.wait(1, &CancellationToken::new()).await);
    }
}

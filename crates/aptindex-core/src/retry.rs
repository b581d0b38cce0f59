//! Exponential backoff between pipeline attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the supervisor's retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total pipeline attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Caps exponential growth.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff on each retry.
    pub multiplier: f64,
    /// Adds `jitter_fraction * backoff / 2` to every delay (0.0 = none).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }
}

impl RetryConfig {
    /// Same attempt ceiling, no waiting. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Self::default()
        }
    }
}

/// Stateless retry policy: computes the next delay from the failure count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay after the `failures`-th failed attempt (1-based), or `None`
    /// once the attempt ceiling is reached.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if !self.should_retry(failures) {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi(failures.saturating_sub(1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        let jitter_ms = capped * self.config.jitter_fraction * 0.5;
        Some(Duration::from_millis((capped + jitter_ms) as u64))
    }

    /// Returns `true` if another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_ceiling() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 20,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 10.0,
            jitter_fraction: 0.0,
        });
        let d = policy.next_delay(5).unwrap();
        assert!(d <= Duration::from_millis(500), "d={d:?} exceeds max");
    }

    #[test]
    fn default_allows_six_attempts() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert!(policy.should_retry(5));
        assert!(!policy.should_retry(6));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_secs(16)));
    }
}

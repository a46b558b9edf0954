//! Retry policy for actor deliveries.
//!
//! Only transient `error` outcomes are retried. The delay before retry `n`
//! (1-based, so the wait after the first attempt is `n = 1`) is:
//!
//! ```text
//! fixed        initial
//! linear       initial * n
//! exponential  initial * 2^(n-1)
//! ```
//!
//! always capped at `max_delay`.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1) as u64;
        let initial = self.initial_delay_ms;
        let delay_ms = match self.backoff {
            Backoff::Fixed => initial,
            Backoff::Linear => initial.saturating_mul(retry),
            Backoff::Exponential => {
                // Shift capped so the multiplier cannot overflow
                let shift = (retry - 1).min(32);
                initial.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy::new(5, backoff, Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let p = policy(Backoff::Exponential);
        let delays: Vec<u64> = (1..=6).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = policy(Backoff::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_secs(3));
        assert_eq!(linear.delay_for(20), Duration::from_secs(10));

        let fixed = policy(Backoff::Fixed);
        assert_eq!(fixed.delay_for(1), fixed.delay_for(4));
    }

    #[test]
    fn test_huge_retry_number_does_not_overflow() {
        let p = policy(Backoff::Exponential);
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_should_retry() {
        let p = RetryPolicy::default();
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_deserialize_defaults() {
        let p: RetryPolicy = toml::from_str("backoff = \"linear\"").unwrap();
        assert_eq!(p.backoff, Backoff::Linear);
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_delay_ms, 1_000);
    }
}

//! Circuit breaker shared by the poll scheduler and the delivery subsystem.
//!
//! Three states:
//! - **Closed**: normal operation
//! - **Open**: calls are refused without touching the connector
//! - **HalfOpen**: the cooldown elapsed and exactly one probe is in flight
//!
//! Transitions:
//! - Closed → Open: `failure_threshold` consecutive failures
//! - Open → HalfOpen: first `allow_request` after `cooldown` elapsed
//! - HalfOpen → Closed: probe succeeded (consecutive count reset to 0)
//! - HalfOpen → Open: probe failed, cooldown restarts

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed.
    #[serde(default = "default_cooldown_ms", rename = "cooldown_ms")]
    cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown_ms: cooldown.as_millis() as u64,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Point-in-time view used for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: State,
    pub consecutive_failures: u32,
    /// Time left before a probe is allowed, while open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
    pub failures_total: u64,
    pub successes_total: u64,
    pub rejections_total: u64,
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<InnerState>,
    failures_total: AtomicU64,
    successes_total: AtomicU64,
    rejections_total: AtomicU64,
}

struct InnerState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(InnerState {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failures_total: AtomicU64::new(0),
            successes_total: AtomicU64::new(0),
            rejections_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a call may proceed.
    ///
    /// While half-open only the single probe granted on the Open → HalfOpen
    /// transition is allowed; further callers are refused until it resolves.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.state.lock();
        match inner.state {
            State::Closed => true,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);
                if cooled {
                    inner.state = State::HalfOpen;
                    return true;
                }
                self.rejections_total.fetch_add(1, Ordering::Relaxed);
                false
            }
            State::HalfOpen => {
                self.rejections_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Record a successful call. Returns `true` if this closed the circuit.
    pub fn record_success(&self) -> bool {
        self.successes_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.state.lock();
        inner.consecutive_failures = 0;
        if inner.state != State::Closed {
            inner.state = State::Closed;
            inner.opened_at = None;
            return true;
        }
        false
    }

    /// Record a failed call. Returns `true` if this opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.state.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            State::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    return true;
                }
                false
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                true
            }
            State::Open => false,
        }
    }

    pub fn state(&self) -> State {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.state.lock();
        let cooldown_remaining = match (inner.state, inner.opened_at) {
            (State::Open, Some(at)) => Some(self.config.cooldown().saturating_sub(at.elapsed())),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_remaining_ms: cooldown_remaining.map(|d| d.as_millis() as u64),
            failures_total: self.failures_total.load(Ordering::Relaxed),
            successes_total: self.successes_total.load(Ordering::Relaxed),
            rejections_total: self.rejections_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::new(threshold, cooldown))
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), State::Closed);

        assert!(cb.record_failure());
        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let cb = breaker(1, Duration::from_secs(10));
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), State::HalfOpen);
        // Only one probe while half-open
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cb.allow_request());

        assert!(cb.record_success());
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_restarts_cooldown() {
        let cb = breaker(1, Duration::from_secs(10));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow_request());

        assert!(cb.record_failure());
        assert_eq!(cb.state(), State::Open);
        assert_eq!(cb.snapshot().cooldown_remaining_ms, Some(10_000));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_counting() {
        let cb = breaker(2, Duration::from_secs(60));

        cb.record_success();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        cb.allow_request();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.successes_total, 2);
        assert_eq!(snapshot.failures_total, 2);
        assert_eq!(snapshot.rejections_total, 1);
        assert_eq!(snapshot.state, State::Open);
        assert_eq!(snapshot.cooldown_remaining_ms, Some(60_000));
    }

    #[test]
    fn test_config_deserialize() {
        let config: CircuitBreakerConfig =
            toml::from_str("failure_threshold = 3\ncooldown_ms = 10000").unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown(), Duration::from_secs(10));
    }
}

//! Delivery Subsystem - hands surviving events to the route's actor.
//!
//! Each route gets one [`RouteDelivery`] at module load, which owns the
//! route's resolved delivery request, circuit breaker, rate limiter and
//! queue-depth counter. Order of checks per delivery:
//!
//! ```text
//! queue_depth admission ─► rate limit ─► ┌─ circuit allows? ─► actor.deliver ─┐
//!                                        └──── retry on `error` with backoff ◄┘
//! ```
//!
//! - `delivered` ends the delivery and closes a half-open circuit.
//! - `rejected` is permanent: never retried and not counted as a circuit
//!   failure, since the actor did answer.
//! - `error` counts toward the circuit and is retried while attempts remain.

pub mod rate_limit;
pub mod retry;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::connectors::{Actor, DeliveryRequest, DeliveryStatus};
use crate::event::Event;
use crate::logger::{LogEntry, LoggerManager, Phase};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use rate_limit::RateLimiter;
pub use retry::{Backoff, RetryPolicy};

/// Advanced delivery settings of a route.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DeliverySettings {
    /// Deliveries per second
    #[serde(default)]
    pub max_rate: Option<f64>,

    /// Maximum in-flight plus waiting deliveries for the route
    #[serde(default)]
    pub queue_depth: Option<usize>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

/// Final, user-visible delivery failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("delivery failed after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: String },

    #[error("circuit open for route '{route}'")]
    CircuitOpen { route: String, attempts: u32 },

    #[error("route '{route}' at queue depth {depth} (limit {limit})")]
    Backpressure {
        route: String,
        depth: usize,
        limit: usize,
    },

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

impl DeliveryError {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Exhausted { attempts, .. } => *attempts,
            DeliveryError::CircuitOpen { attempts, .. } => *attempts,
            DeliveryError::Backpressure { .. } => 0,
            DeliveryError::Rejected(_) => 1,
        }
    }

    /// Whether the event should be written to the dead letter file.
    pub fn is_dead_letter(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}

/// A successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: u32,
}

/// Live per-route delivery state for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshot {
    pub circuit: BreakerSnapshot,
    pub in_flight: usize,
}

/// Decrements the route's queue depth when the delivery finishes.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Delivery state and policy for one route.
pub struct RouteDelivery {
    route: String,
    actor_id: String,
    actor: Arc<dyn Actor>,
    request: DeliveryRequest,
    retry: RetryPolicy,
    queue_depth: Option<usize>,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
    in_flight: AtomicUsize,
}

impl RouteDelivery {
    /// `config` is the actor's config already merged with the route's.
    pub fn new(
        route: impl Into<String>,
        actor_id: impl Into<String>,
        actor: Arc<dyn Actor>,
        config: Value,
        context: Option<String>,
        settings: &DeliverySettings,
    ) -> Self {
        let route = route.into();
        Self {
            request: DeliveryRequest {
                route: route.clone(),
                config,
                context,
            },
            route,
            actor_id: actor_id.into(),
            actor,
            retry: settings.retry,
            queue_depth: settings.queue_depth,
            breaker: CircuitBreaker::new(settings.circuit),
            limiter: settings.max_rate.and_then(RateLimiter::new),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            circuit: self.breaker.snapshot(),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    fn entry(&self, phase: Phase, event: &Event) -> LogEntry {
        LogEntry::for_event(phase, event)
            .with_route(&self.route)
            .with_target(&self.actor_id)
    }

    /// Deliver `event`, retrying transient errors per the route's policy.
    pub async fn deliver(
        &self,
        event: &Event,
        logger: &LoggerManager,
    ) -> Result<DeliveryReport, DeliveryError> {
        let depth = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = DepthGuard(&self.in_flight);

        if let Some(limit) = self.queue_depth {
            if depth > limit {
                warn!(
                    route = %self.route,
                    depth,
                    limit,
                    event_id = %event.id,
                    "Delivery rejected by backpressure"
                );
                logger.emit(
                    self.entry(Phase::DeliveryBackpressure, event)
                        .with_queue_depth(depth)
                        .with_error(format!("queue depth {} exceeds {}", depth, limit)),
                );
                return Err(DeliveryError::Backpressure {
                    route: self.route.clone(),
                    depth,
                    limit,
                });
            }
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let mut attempts = 0u32;
        loop {
            if !self.breaker.allow_request() {
                debug!(route = %self.route, event_id = %event.id, "Delivery circuit open");
                logger.emit(
                    self.entry(Phase::DeliveryCircuitOpen, event)
                        .with_meta("attempts", attempts.into()),
                );
                return Err(DeliveryError::CircuitOpen {
                    route: self.route.clone(),
                    attempts,
                });
            }

            attempts += 1;
            logger.emit(
                self.entry(Phase::DeliveryAttempt, event)
                    .with_queue_depth(depth)
                    .with_meta("attempt", attempts.into()),
            );

            let started = Instant::now();
            let result = self.actor.deliver(event, &self.request).await;
            let elapsed = started.elapsed();

            match result.status {
                DeliveryStatus::Delivered => {
                    if self.breaker.record_success() {
                        debug!(route = %self.route, "Delivery circuit closed");
                    }
                    logger.emit(
                        self.entry(Phase::DeliverySuccess, event)
                            .with_duration(elapsed)
                            .with_meta("attempts", attempts.into()),
                    );
                    return Ok(DeliveryReport { attempts });
                }
                DeliveryStatus::Rejected => {
                    self.breaker.record_success();
                    let error = result.error.unwrap_or_else(|| "rejected".to_string());
                    logger.emit(
                        self.entry(Phase::DeliveryRejected, event)
                            .with_duration(elapsed)
                            .with_error(&error),
                    );
                    return Err(DeliveryError::Rejected(error));
                }
                DeliveryStatus::Error => {
                    let error = result.error.unwrap_or_else(|| "delivery error".to_string());
                    if self.breaker.record_failure() {
                        warn!(
                            route = %self.route,
                            actor = %self.actor_id,
                            cooldown_ms = self.breaker.config().cooldown().as_millis() as u64,
                            "Delivery circuit opened"
                        );
                    }

                    if !self.retry.should_retry(attempts) {
                        logger.emit(
                            self.entry(Phase::DeliveryFailed, event)
                                .with_duration(elapsed)
                                .with_error(&error)
                                .with_meta("attempts", attempts.into()),
                        );
                        return Err(DeliveryError::Exhausted { attempts, error });
                    }

                    let delay = self.retry.delay_for(attempts);
                    logger.emit(
                        self.entry(Phase::DeliveryRetry, event)
                            .with_duration(elapsed)
                            .with_error(&error)
                            .with_meta("attempt", attempts.into())
                            .with_meta("delayMs", (delay.as_millis() as u64).into()),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::DeliveryResult;
    use crate::event::EventType;
    use crate::logger::{Logger, MemoryLogger};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Replays scripted results, then repeats the last one.
    struct ScriptedActor {
        script: Mutex<VecDeque<DeliveryResult>>,
        last: DeliveryResult,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedActor {
        fn new(script: Vec<DeliveryResult>) -> Arc<Self> {
            let last = script.last().cloned().unwrap_or_else(DeliveryResult::delivered);
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Actor for ScriptedActor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn deliver(&self, _event: &Event, _request: &DeliveryRequest) -> DeliveryResult {
            self.calls.lock().push(Instant::now());
            self.script.lock().pop_front().unwrap_or_else(|| self.last.clone())
        }
    }

    /// Blocks inside `deliver` until released.
    struct GateActor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Actor for GateActor {
        fn name(&self) -> &str {
            "gate"
        }

        async fn deliver(&self, _event: &Event, _request: &DeliveryRequest) -> DeliveryResult {
            self.entered.notify_one();
            self.release.notified().await;
            DeliveryResult::delivered()
        }
    }

    fn settings(value: Value) -> DeliverySettings {
        serde_json::from_value(value).unwrap()
    }

    fn delivery(actor: Arc<dyn Actor>, settings: &DeliverySettings) -> RouteDelivery {
        RouteDelivery::new("route-1", "actor-1", actor, json!({}), None, settings)
    }

    fn logger() -> (LoggerManager, MemoryLogger) {
        let memory = MemoryLogger::new(1000);
        let manager = LoggerManager::new(
            "m",
            vec![("mem".to_string(), Arc::new(memory.clone()) as Arc<dyn Logger>)],
            1000,
        );
        (manager, memory)
    }

    fn event() -> Event {
        Event::new("s", EventType::Post, json!({})).with_module("m")
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_retry_sequence() {
        let actor = ScriptedActor::new(vec![DeliveryResult::error("down")]);
        let route = delivery(
            actor.clone(),
            &settings(json!({
                "retry": {
                    "max_attempts": 3,
                    "backoff": "exponential",
                    "initial_delay_ms": 1000,
                    "max_delay_ms": 10000
                }
            })),
        );
        let (manager, memory) = logger();

        let result = route.deliver(&event(), &manager).await;
        assert_eq!(
            result,
            Err(DeliveryError::Exhausted {
                attempts: 3,
                error: "down".into()
            })
        );

        let times = actor.call_times();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::from_secs(1));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));

        manager.shutdown(Duration::from_secs(1)).await;
        let phases: Vec<Phase> = memory.entries().into_iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::DeliveryAttempt,
                Phase::DeliveryRetry,
                Phase::DeliveryAttempt,
                Phase::DeliveryRetry,
                Phase::DeliveryAttempt,
                Phase::DeliveryFailed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_then_success() {
        let actor = ScriptedActor::new(vec![
            DeliveryResult::error("blip"),
            DeliveryResult::delivered(),
        ]);
        let route = delivery(actor.clone(), &DeliverySettings::default());
        let (manager, _memory) = logger();

        let report = route.deliver(&event(), &manager).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(route.snapshot().circuit.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rejected_is_never_retried() {
        let actor = ScriptedActor::new(vec![DeliveryResult::rejected("bad request")]);
        let route = delivery(actor.clone(), &DeliverySettings::default());
        let (manager, _memory) = logger();

        let result = route.deliver(&event(), &manager).await;
        assert_eq!(result, Err(DeliveryError::Rejected("bad request".into())));
        assert_eq!(actor.call_times().len(), 1);
        assert!(!result.unwrap_err().is_dead_letter());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_fails_fast_then_probes() {
        let actor = ScriptedActor::new(vec![
            DeliveryResult::error("down"),
            DeliveryResult::error("down"),
            DeliveryResult::delivered(),
        ]);
        let route = delivery(
            actor.clone(),
            &settings(json!({
                "retry": {"max_attempts": 1},
                "circuit": {"failure_threshold": 2, "cooldown_ms": 10000}
            })),
        );
        let (manager, _memory) = logger();

        assert!(matches!(
            route.deliver(&event(), &manager).await,
            Err(DeliveryError::Exhausted { .. })
        ));
        assert!(matches!(
            route.deliver(&event(), &manager).await,
            Err(DeliveryError::Exhausted { .. })
        ));

        // Open: no connector call
        let result = route.deliver(&event(), &manager).await;
        assert!(matches!(result, Err(DeliveryError::CircuitOpen { attempts: 0, .. })));
        assert_eq!(actor.call_times().len(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        let report = route.deliver(&event(), &manager).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(route.snapshot().circuit.state, crate::circuit_breaker::State::Closed);
    }

    #[tokio::test]
    async fn test_queue_depth_backpressure() {
        let actor = Arc::new(GateActor {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let route = Arc::new(delivery(
            actor.clone(),
            &settings(json!({"queue_depth": 1})),
        ));
        let (manager, memory) = logger();
        let manager = Arc::new(manager);

        let first = {
            let route = route.clone();
            let manager = manager.clone();
            tokio::spawn(async move { route.deliver(&event(), &manager).await })
        };
        actor.entered.notified().await;
        assert_eq!(route.snapshot().in_flight, 1);

        let second = route.deliver(&event(), &manager).await;
        assert_eq!(
            second,
            Err(DeliveryError::Backpressure {
                route: "route-1".into(),
                depth: 2,
                limit: 1
            })
        );

        actor.release.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(route.snapshot().in_flight, 0);

        manager.shutdown(Duration::from_secs(1)).await;
        let backpressure = memory
            .entries()
            .into_iter()
            .find(|e| e.phase == Phase::DeliveryBackpressure)
            .unwrap();
        assert_eq!(backpressure.queue_depth, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_deliveries() {
        let actor = ScriptedActor::new(vec![DeliveryResult::delivered()]);
        let route = delivery(actor.clone(), &settings(json!({"max_rate": 1.0})));
        let (manager, _memory) = logger();

        for _ in 0..3 {
            route.deliver(&event(), &manager).await.unwrap();
        }
        let times = actor.call_times();
        assert!(times[2] - times[0] >= Duration::from_secs(2));
    }
}

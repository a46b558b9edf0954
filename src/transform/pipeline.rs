//! Transform Pipeline Executor.
//!
//! Runs a route's transform list strictly in declaration order. Each step is
//! bounded by its own timeout (the transform's `timeout_ms`, else the
//! runtime default). Exactly one [`PipelineOutcome`] results per route-match.
//!
//! Effective error policy for a failing step, first set wins:
//! route-level override, transform-level default, [`ErrorPolicy::Pass`].

use super::{ErrorPolicy, Transform, TransformContext, TransformError};
use crate::event::Event;
use crate::logger::{LogEntry, LoggerManager, Phase};
use crate::router::Route;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default per-step timeout.
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(5);

/// A transform instance declared by a module, with its defaults.
pub struct BoundTransform {
    pub id: String,
    pub transform: Arc<dyn Transform>,
    pub on_error: ErrorPolicy,
    pub timeout: Option<Duration>,
}

impl BoundTransform {
    pub fn new(id: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
        Self {
            id: id.into(),
            transform,
            on_error: ErrorPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of running one route's transform chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every step passed; deliver this event
    Deliver(Event),

    /// A step returned no event, or failed under the `drop` policy
    Dropped { transform: String, by_error: bool },

    /// A step failed under the `halt` policy
    Halted { transform: String, error: String },
}

/// The transforms of one module, shared by all its routes.
pub struct TransformPipeline {
    transforms: HashMap<String, Arc<BoundTransform>>,
    default_timeout: Duration,
}

impl TransformPipeline {
    pub fn new(transforms: Vec<BoundTransform>, default_timeout: Duration) -> Self {
        Self {
            transforms: transforms
                .into_iter()
                .map(|t| (t.id.clone(), Arc::new(t)))
                .collect(),
            default_timeout,
        }
    }

    /// Run `route`'s transforms over `event`.
    pub async fn run(&self, route: &Route, event: Event, logger: &LoggerManager) -> PipelineOutcome {
        let context = TransformContext {
            module: event.module.clone(),
            source: event.source.clone(),
            target: route.target.actor.clone(),
            event_type: event.event_type,
            route_name: route.name.clone(),
        };

        let mut current = event;

        for step in &route.transforms {
            let id = step.name();
            let entry = |phase: Phase, event: &Event| {
                LogEntry::for_event(phase, event)
                    .with_route(&route.name)
                    .with_target(&route.target.actor)
                    .with_transform(id)
            };

            let Some(bound) = self.transforms.get(id) else {
                let error = format!("unknown transform '{}'", id);
                logger.emit(entry(Phase::TransformHalt, &current).with_error(&error));
                return PipelineOutcome::Halted {
                    transform: id.to_string(),
                    error,
                };
            };

            let limit = bound.timeout.unwrap_or(self.default_timeout);
            let started = Instant::now();
            let result = match tokio::time::timeout(limit, bound.transform.execute(&current, &context)).await {
                Ok(result) => result,
                Err(_) => Err(TransformError::Timeout(limit.as_millis() as u64)),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(Some(next)) => {
                    logger.emit(entry(Phase::TransformPass, &next).with_duration(elapsed));
                    current = next;
                }
                Ok(None) => {
                    logger.emit(
                        entry(Phase::TransformDrop, &current)
                            .with_duration(elapsed)
                            .with_meta("reason", "content".into()),
                    );
                    return PipelineOutcome::Dropped {
                        transform: id.to_string(),
                        by_error: false,
                    };
                }
                Err(e) => {
                    let policy = step.on_error().unwrap_or(bound.on_error);
                    let error = e.to_string();
                    debug!(
                        route = %route.name,
                        transform = %id,
                        error = %error,
                        policy = ?policy,
                        "Transform step failed"
                    );
                    logger.emit(
                        entry(Phase::TransformError, &current)
                            .with_duration(elapsed)
                            .with_error(&error),
                    );

                    match policy {
                        ErrorPolicy::Pass => continue,
                        ErrorPolicy::Drop => {
                            logger.emit(
                                entry(Phase::TransformDrop, &current)
                                    .with_error(&error)
                                    .with_meta("reason", "error".into()),
                            );
                            return PipelineOutcome::Dropped {
                                transform: id.to_string(),
                                by_error: true,
                            };
                        }
                        ErrorPolicy::Halt => {
                            logger.emit(entry(Phase::TransformHalt, &current).with_error(&error));
                            return PipelineOutcome::Halted {
                                transform: id.to_string(),
                                error,
                            };
                        }
                    }
                }
            }
        }

        PipelineOutcome::Deliver(current)
    }

    /// Shut down every transform, logging failures.
    pub async fn shutdown(&self) {
        for bound in self.transforms.values() {
            if let Err(e) = bound.transform.shutdown().await {
                tracing::warn!(transform = %bound.id, error = %e, "Transform shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::logger::{Logger, MemoryLogger};
    use crate::router::RouteDefinition;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends its tag to `payload.seen`.
    struct Tagger {
        tag: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transform for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        async fn execute(
            &self,
            event: &Event,
            _context: &TransformContext,
        ) -> Result<Option<Event>, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut payload = event.payload.clone();
            let seen = payload
                .as_object_mut()
                .unwrap()
                .entry("seen")
                .or_insert_with(|| json!([]));
            seen.as_array_mut().unwrap().push(json!(self.tag));
            Ok(Some(event.with_payload(payload)))
        }
    }

    struct Dropper;

    #[async_trait]
    impl Transform for Dropper {
        fn name(&self) -> &str {
            "dropper"
        }

        async fn execute(&self, _: &Event, _: &TransformContext) -> Result<Option<Event>, TransformError> {
            Ok(None)
        }
    }

    struct Failer;

    #[async_trait]
    impl Transform for Failer {
        fn name(&self) -> &str {
            "failer"
        }

        async fn execute(&self, _: &Event, _: &TransformContext) -> Result<Option<Event>, TransformError> {
            Err(TransformError::Failed("boom".into()))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Transform for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn execute(&self, event: &Event, _: &TransformContext) -> Result<Option<Event>, TransformError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(event.clone()))
        }
    }

    fn route(transforms: Value) -> Route {
        let definition: RouteDefinition = serde_json::from_value(json!({
            "name": "r1",
            "when": { "source": "s", "events": ["post"] },
            "transforms": transforms,
            "then": { "actor": "a" }
        }))
        .unwrap();
        Route::compile(&definition).unwrap()
    }

    fn tagger(tag: &'static str, calls: &Arc<AtomicUsize>) -> Arc<dyn Transform> {
        Arc::new(Tagger {
            tag,
            calls: calls.clone(),
        })
    }

    fn logger() -> (LoggerManager, MemoryLogger) {
        let memory = MemoryLogger::new(100);
        let manager = LoggerManager::new(
            "m",
            vec![("mem".to_string(), Arc::new(memory.clone()) as Arc<dyn Logger>)],
            100,
        );
        (manager, memory)
    }

    fn event() -> Event {
        Event::new("s", EventType::Post, json!({})).with_module("m")
    }

    async fn phases(manager: LoggerManager, memory: &MemoryLogger) -> Vec<Phase> {
        manager.shutdown(Duration::from_secs(1)).await;
        memory.entries().into_iter().map(|e| e.phase).collect()
    }

    #[tokio::test]
    async fn test_steps_run_in_declared_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = TransformPipeline::new(
            vec![
                BoundTransform::new("a", tagger("a", &calls)),
                BoundTransform::new("b", tagger("b", &calls)),
            ],
            DEFAULT_TRANSFORM_TIMEOUT,
        );
        let (manager, _memory) = logger();
        let original = event();

        let outcome = pipeline.run(&route(json!(["b", "a"])), original.clone(), &manager).await;
        let PipelineOutcome::Deliver(delivered) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(delivered.payload["seen"], json!(["b", "a"]));
        assert_eq!(delivered.id, original.id);
        assert_eq!(delivered.trace_id, original.trace_id);
        // Input untouched
        assert_eq!(original.payload, json!({}));
    }

    #[tokio::test]
    async fn test_drop_halts_before_later_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = TransformPipeline::new(
            vec![
                BoundTransform::new("drop", Arc::new(Dropper)),
                BoundTransform::new("tag", tagger("t", &calls)),
            ],
            DEFAULT_TRANSFORM_TIMEOUT,
        );
        let (manager, memory) = logger();

        let outcome = pipeline.run(&route(json!(["drop", "tag"])), event(), &manager).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Dropped {
                transform: "drop".into(),
                by_error: false
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(phases(manager, &memory).await, vec![Phase::TransformDrop]);
    }

    #[tokio::test]
    async fn test_error_under_pass_keeps_pre_step_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = TransformPipeline::new(
            vec![
                BoundTransform::new("first", tagger("first", &calls)),
                BoundTransform::new("fail", Arc::new(Failer)),
                BoundTransform::new("last", tagger("last", &calls)),
            ],
            DEFAULT_TRANSFORM_TIMEOUT,
        );
        let (manager, memory) = logger();

        let outcome = pipeline
            .run(&route(json!(["first", "fail", "last"])), event(), &manager)
            .await;
        let PipelineOutcome::Deliver(delivered) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(delivered.payload["seen"], json!(["first", "last"]));
        assert_eq!(
            phases(manager, &memory).await,
            vec![Phase::TransformPass, Phase::TransformError, Phase::TransformPass]
        );
    }

    #[tokio::test]
    async fn test_policy_precedence() {
        let pipeline = TransformPipeline::new(
            vec![BoundTransform::new("fail", Arc::new(Failer)).with_on_error(ErrorPolicy::Drop)],
            DEFAULT_TRANSFORM_TIMEOUT,
        );
        let (manager, _memory) = logger();

        // Transform-level default applies
        let outcome = pipeline.run(&route(json!(["fail"])), event(), &manager).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Dropped {
                transform: "fail".into(),
                by_error: true
            }
        );

        // Route-level override wins
        let outcome = pipeline
            .run(&route(json!([{"name": "fail", "on_error": "halt"}])), event(), &manager)
            .await;
        assert!(matches!(outcome, PipelineOutcome::Halted { ref transform, .. } if transform == "fail"));

        let outcome = pipeline
            .run(&route(json!([{"name": "fail", "on_error": "pass"}])), event(), &manager)
            .await;
        assert!(matches!(outcome, PipelineOutcome::Deliver(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_an_error() {
        let pipeline = TransformPipeline::new(
            vec![BoundTransform::new("slow", Arc::new(Sleeper))
                .with_timeout(Duration::from_millis(100))
                .with_on_error(ErrorPolicy::Halt)],
            DEFAULT_TRANSFORM_TIMEOUT,
        );
        let (manager, _memory) = logger();

        let outcome = pipeline.run(&route(json!(["slow"])), event(), &manager).await;
        match outcome {
            PipelineOutcome::Halted { error, .. } => assert!(error.contains("timed out after 100ms")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_transforms_delivers_unchanged() {
        let pipeline = TransformPipeline::new(Vec::new(), DEFAULT_TRANSFORM_TIMEOUT);
        let (manager, _memory) = logger();
        let original = event();

        let outcome = pipeline.run(&route(json!([])), original.clone(), &manager).await;
        assert_eq!(outcome, PipelineOutcome::Deliver(original));
    }
}

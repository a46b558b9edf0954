//! Scheduler - drives every source of a module on its own interval.
//!
//! Each source gets a [`SourceRunner`]. A tick polls the source (or drains
//! its webhook buffer), stamps and validates the events, publishes them to
//! the bus, and only then advances the stored checkpoint. Ticks never
//! overlap: if the previous poll is still running the tick is skipped and
//! logged, not queued. A per-source circuit breaker stops polling a source
//! that keeps failing until its cooldown elapses.

use crate::bus::EventBus;
use crate::buffer::{BufferError, WebhookBuffer};
use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use crate::connectors::{ConnectorError, PollBatch, Source, WebhookHandler};
use crate::event::Event;
use crate::logger::{LogEntry, LoggerManager, Phase};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one source, as last observed by its runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub status: HealthStatus,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub events_emitted: u64,
    pub circuit_open: bool,
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct HealthRecord {
    last_attempt: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    events_emitted: u64,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Poll finished; `published` events reached the bus
    Polled { published: usize },
    /// The previous poll was still in flight
    Skipped,
    /// The circuit is open and the cooldown has not elapsed
    CircuitOpen,
    Failed,
}

#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("checkpoint store: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error("bus refused event: {0}")]
    Bus(#[from] crate::bus::BusError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Why a webhook push was refused.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source does not accept webhooks")]
    NotWebhook,

    #[error(transparent)]
    Payload(#[from] ConnectorError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Static settings of one source.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub interval: Duration,
    pub circuit: CircuitBreakerConfig,
    pub webhook_secret: Option<String>,
}

/// Owns the polling of one source.
pub struct SourceRunner {
    module: String,
    source_id: String,
    source: Arc<dyn Source>,
    settings: SourceSettings,
    breaker: CircuitBreaker,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Arc<dyn EventBus>,
    buffer: Option<Arc<WebhookBuffer>>,
    logger: Arc<LoggerManager>,
    health: RwLock<HealthRecord>,
    in_flight: tokio::sync::Mutex<()>,
}

impl SourceRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: impl Into<String>,
        source_id: impl Into<String>,
        source: Arc<dyn Source>,
        settings: SourceSettings,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Arc<dyn EventBus>,
        buffer: Option<Arc<WebhookBuffer>>,
        logger: Arc<LoggerManager>,
    ) -> Self {
        Self {
            module: module.into(),
            source_id: source_id.into(),
            source,
            breaker: CircuitBreaker::new(settings.circuit),
            settings,
            checkpoints,
            bus,
            buffer,
            logger,
            health: RwLock::new(HealthRecord::default()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.settings.webhook_secret.as_deref()
    }

    pub fn webhook_handler(&self) -> Option<&dyn WebhookHandler> {
        self.source.webhook()
    }

    pub fn health(&self) -> SourceHealth {
        let breaker = self.breaker.snapshot();
        let record = self.health.read();
        let circuit_open = breaker.state != State::Closed;
        let status = if circuit_open {
            HealthStatus::Unhealthy
        } else if breaker.consecutive_failures > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        SourceHealth {
            status,
            last_attempt: record.last_attempt,
            last_success: record.last_success,
            consecutive_errors: breaker.consecutive_failures,
            last_error: record.last_error.clone(),
            events_emitted: record.events_emitted,
            circuit_open,
            buffered: self.buffer.as_ref().map_or(0, |b| b.len()),
        }
    }

    /// Parse a (signature-verified) webhook body and buffer the events for
    /// the next tick. Returns how many events were buffered.
    pub async fn accept_webhook(&self, body: &[u8]) -> Result<usize, IngestError> {
        let (Some(handler), Some(buffer)) = (self.source.webhook(), &self.buffer) else {
            return Err(IngestError::NotWebhook);
        };
        let events = handler.handle(&self.source_id, body)?;
        let count = buffer.push(events).await?;
        self.logger.emit(
            LogEntry::new(Phase::WebhookReceived, &self.module)
                .with_source(&self.source_id)
                .with_meta("events", json!(count)),
        );
        Ok(count)
    }

    /// Run one scheduled tick.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(module = %self.module, source = %self.source_id, "Poll still in flight, tick skipped");
            self.logger.emit(
                LogEntry::new(Phase::SourceSkipped, &self.module)
                    .with_source(&self.source_id)
                    .with_meta("reason", json!("in_flight")),
            );
            return TickOutcome::Skipped;
        };

        if !self.breaker.allow_request() {
            debug!(module = %self.module, source = %self.source_id, "Circuit open, tick skipped");
            return TickOutcome::CircuitOpen;
        }

        self.health.write().last_attempt = Some(Utc::now());
        let started = Instant::now();

        match self.poll_once().await {
            Ok(published) => {
                {
                    let mut record = self.health.write();
                    record.last_success = Some(Utc::now());
                    record.events_emitted += published as u64;
                }
                if self.breaker.record_success() {
                    info!(module = %self.module, source = %self.source_id, "Source circuit closed");
                    self.logger.emit(
                        LogEntry::new(Phase::SourceCircuitClosed, &self.module)
                            .with_source(&self.source_id),
                    );
                }
                self.logger.emit(
                    LogEntry::new(Phase::SourcePoll, &self.module)
                        .with_source(&self.source_id)
                        .with_duration(started.elapsed())
                        .with_meta("events", json!(published)),
                );
                TickOutcome::Polled { published }
            }
            Err(e) => {
                let error = e.to_string();
                self.health.write().last_error = Some(error.clone());
                warn!(module = %self.module, source = %self.source_id, error = %error, "Source poll failed");
                self.logger.emit(
                    LogEntry::new(Phase::SourceError, &self.module)
                        .with_source(&self.source_id)
                        .with_duration(started.elapsed())
                        .with_error(&error),
                );
                if self.breaker.record_failure() {
                    let cooldown = self.breaker.config().cooldown();
                    warn!(
                        module = %self.module,
                        source = %self.source_id,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Source circuit opened"
                    );
                    self.logger.emit(
                        LogEntry::new(Phase::SourceCircuitOpen, &self.module)
                            .with_source(&self.source_id)
                            .with_error(&error)
                            .with_meta("cooldownMs", json!(cooldown.as_millis() as u64)),
                    );
                }
                TickOutcome::Failed
            }
        }
    }

    async fn poll_once(&self) -> Result<usize, PollError> {
        let checkpoint = self.checkpoints.get(&self.source_id).await?;
        let PollBatch {
            events: polled,
            checkpoint: next_checkpoint,
        } = self.source.poll(checkpoint.as_deref()).await?;

        let mut published = self.publish_all(polled).await?;

        if let Some(next) = next_checkpoint {
            if checkpoint.as_deref() != Some(next.as_str()) {
                self.checkpoints.set(&self.source_id, &next).await?;
            }
        }

        if let Some(buffer) = &self.buffer {
            let drained = buffer.drain();
            if !drained.is_empty() {
                published += self.publish_buffered(buffer, drained).await?;
                buffer.commit().await?;
            }
        }

        Ok(published)
    }

    async fn publish_all(&self, events: Vec<Event>) -> Result<usize, PollError> {
        let mut published = 0;
        for event in events {
            if self.publish(event).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    /// Publish drained buffer events; on a bus failure the unpublished
    /// remainder goes back to the buffer.
    async fn publish_buffered(
        &self,
        buffer: &WebhookBuffer,
        drained: Vec<Event>,
    ) -> Result<usize, PollError> {
        let mut published = 0;
        let mut remaining = drained.into_iter();
        while let Some(event) = remaining.next() {
            match self.publish(event.clone()).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(e) => {
                    let mut unpublished = vec![event];
                    unpublished.extend(remaining);
                    buffer.requeue(unpublished);
                    return Err(e);
                }
            }
        }
        Ok(published)
    }

    /// Stamp, validate and publish one event. Invalid events are logged and
    /// dropped (`Ok(false)`).
    async fn publish(&self, mut event: Event) -> Result<bool, PollError> {
        event.module = self.module.clone();
        event.source = self.source_id.clone();

        if let Err(e) = event.validate() {
            warn!(
                module = %self.module,
                source = %self.source_id,
                event_id = %event.id,
                error = %e,
                "Event failed schema validation, dropped"
            );
            self.logger
                .emit(LogEntry::for_event(Phase::SchemaInvalid, &event).with_error(e.to_string()));
            return Ok(false);
        }

        let entry = LogEntry::for_event(Phase::BusEnqueued, &event);
        let seq = self.bus.publish(event).await?;
        self.logger.emit(entry.with_meta("seq", json!(seq)));
        Ok(true)
    }
}

/// Runs every [`SourceRunner`] of a module.
pub struct Scheduler {
    module: String,
    runners: BTreeMap<String, Arc<SourceRunner>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(module: impl Into<String>, runners: Vec<Arc<SourceRunner>>) -> Self {
        Self {
            module: module.into(),
            runners: runners
                .into_iter()
                .map(|r| (r.source_id().to_string(), r))
                .collect(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn runner(&self, source_id: &str) -> Option<&Arc<SourceRunner>> {
        self.runners.get(source_id)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    pub fn health(&self) -> BTreeMap<String, SourceHealth> {
        self.runners
            .iter()
            .map(|(id, runner)| (id.clone(), runner.health()))
            .collect()
    }

    /// Spawn one interval loop per source. The first tick fires immediately.
    pub fn start(&self) {
        for runner in self.runners.values() {
            let runner = Arc::clone(runner);
            let cancel = self.cancel.clone();
            let tracker = self.tracker.clone();
            self.tracker.spawn(async move {
                let mut interval = tokio::time::interval(runner.interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let runner = Arc::clone(&runner);
                            tracker.spawn(async move {
                                runner.tick().await;
                            });
                        }
                    }
                }
            });
        }
        info!(module = %self.module, sources = self.runners.len(), "Scheduler started");
    }

    /// Stop starting ticks and wait up to `deadline` for in-flight polls.
    /// Returns `false` if polls were still running at the deadline.
    pub async fn stop(&self, deadline: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(deadline, self.tracker.wait()).await {
            Ok(()) => {
                debug!(module = %self.module, "Scheduler stopped");
                true
            }
            Err(_) => {
                warn!(module = %self.module, "Polls still running at scheduler deadline");
                false
            }
        }
    }
}

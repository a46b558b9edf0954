//! Pipeline log entries and the Logger Manager.
//!
//! Every phase transition of an event (poll, enqueue, match, each transform
//! step, each delivery attempt) produces one [`LogEntry`]. The
//! [`LoggerManager`] fans each entry out to all loggers configured for a
//! module.
//!
//! Each logger gets its own bounded queue and worker task. Emitting never
//! awaits: a logger that is slow, hangs, errors or panics only loses its own
//! entries, and the event keeps moving.

pub mod builtin;

use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub use builtin::{JsonlLogger, MemoryLogger, TracingLogger};

/// Default per-call timeout for a logger.
const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors a logger may report. The manager only ever logs them.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("logger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("logger init failed: {0}")]
    Init(String),
}

/// Phase tag carried by every log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "source.poll")]
    SourcePoll,
    #[serde(rename = "source.skipped")]
    SourceSkipped,
    #[serde(rename = "source.error")]
    SourceError,
    #[serde(rename = "source.circuit_open")]
    SourceCircuitOpen,
    #[serde(rename = "source.circuit_closed")]
    SourceCircuitClosed,
    #[serde(rename = "webhook.received")]
    WebhookReceived,
    #[serde(rename = "schema.invalid")]
    SchemaInvalid,
    #[serde(rename = "bus.enqueued")]
    BusEnqueued,
    #[serde(rename = "bus.replayed")]
    BusReplayed,
    #[serde(rename = "bus.acked")]
    BusAcked,
    #[serde(rename = "route.matched")]
    RouteMatched,
    #[serde(rename = "route.unmatched")]
    RouteUnmatched,
    #[serde(rename = "transform.pass")]
    TransformPass,
    #[serde(rename = "transform.drop")]
    TransformDrop,
    #[serde(rename = "transform.error")]
    TransformError,
    #[serde(rename = "transform.halt")]
    TransformHalt,
    #[serde(rename = "delivery.attempt")]
    DeliveryAttempt,
    #[serde(rename = "delivery.success")]
    DeliverySuccess,
    #[serde(rename = "delivery.rejected")]
    DeliveryRejected,
    #[serde(rename = "delivery.retry")]
    DeliveryRetry,
    #[serde(rename = "delivery.failed")]
    DeliveryFailed,
    #[serde(rename = "delivery.circuit_open")]
    DeliveryCircuitOpen,
    #[serde(rename = "delivery.backpressure")]
    DeliveryBackpressure,
    #[serde(rename = "pipeline.abandoned")]
    PipelineAbandoned,
    #[serde(rename = "module.loaded")]
    ModuleLoaded,
    #[serde(rename = "module.unloaded")]
    ModuleUnloaded,
    #[serde(rename = "system.error")]
    SystemError,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::SourcePoll => "source.poll",
            Phase::SourceSkipped => "source.skipped",
            Phase::SourceError => "source.error",
            Phase::SourceCircuitOpen => "source.circuit_open",
            Phase::SourceCircuitClosed => "source.circuit_closed",
            Phase::WebhookReceived => "webhook.received",
            Phase::SchemaInvalid => "schema.invalid",
            Phase::BusEnqueued => "bus.enqueued",
            Phase::BusReplayed => "bus.replayed",
            Phase::BusAcked => "bus.acked",
            Phase::RouteMatched => "route.matched",
            Phase::RouteUnmatched => "route.unmatched",
            Phase::TransformPass => "transform.pass",
            Phase::TransformDrop => "transform.drop",
            Phase::TransformError => "transform.error",
            Phase::TransformHalt => "transform.halt",
            Phase::DeliveryAttempt => "delivery.attempt",
            Phase::DeliverySuccess => "delivery.success",
            Phase::DeliveryRejected => "delivery.rejected",
            Phase::DeliveryRetry => "delivery.retry",
            Phase::DeliveryFailed => "delivery.failed",
            Phase::DeliveryCircuitOpen => "delivery.circuit_open",
            Phase::DeliveryBackpressure => "delivery.backpressure",
            Phase::PipelineAbandoned => "pipeline.abandoned",
            Phase::ModuleLoaded => "module.loaded",
            Phase::ModuleUnloaded => "module.unloaded",
            Phase::SystemError => "system.error",
        }
    }

    /// Phases that describe a failure of some kind.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Phase::SourceError
                | Phase::SourceCircuitOpen
                | Phase::SchemaInvalid
                | Phase::TransformError
                | Phase::TransformHalt
                | Phase::DeliveryFailed
                | Phase::DeliveryCircuitOpen
                | Phase::DeliveryBackpressure
                | Phase::PipelineAbandoned
                | Phase::SystemError
        )
    }
}

/// One record per pipeline phase transition. Append-only, never mutated
/// after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    pub phase: Phase,

    pub module: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl LogEntry {
    pub fn new(phase: Phase, module: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: None,
            trace_id: None,
            phase,
            module: module.into(),
            source: None,
            target: None,
            route: None,
            transform: None,
            duration_ms: None,
            queue_depth: None,
            error: None,
            metadata: Map::new(),
        }
    }

    /// Entry correlated with an event: copies its id, trace id and source.
    pub fn for_event(phase: Phase, event: &Event) -> Self {
        let mut entry = Self::new(phase, event.module.clone());
        entry.event_id = Some(event.id);
        entry.trace_id = Some(event.trace_id.clone());
        entry.source = Some(event.source.clone());
        entry
    }

    /// A `system.error` entry. `fatal` tells readers whether the runtime
    /// itself must stop or only one event failed.
    pub fn system_error(module: impl Into<String>, error: impl Into<String>, fatal: bool) -> Self {
        Self::new(Phase::SystemError, module)
            .with_error(error)
            .with_meta("fatal", Value::Bool(fatal))
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The `fatal` flag of a `system.error` entry.
    pub fn is_fatal(&self) -> bool {
        self.metadata
            .get("fatal")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A destination for pipeline log entries.
///
/// `log` must not panic and should return quickly; the manager isolates
/// failures anyway, but a misbehaving logger loses its own entries.
#[async_trait]
pub trait Logger: Send + Sync {
    /// Connector type name (e.g. "jsonl")
    fn name(&self) -> &str;

    async fn init(&mut self, _config: &Value) -> Result<(), LoggerError> {
        Ok(())
    }

    async fn log(&self, entry: &LogEntry) -> Result<(), LoggerError>;

    async fn shutdown(&self) -> Result<(), LoggerError> {
        Ok(())
    }
}

struct LoggerSink {
    id: String,
    logger: Arc<dyn Logger>,
    tx: RwLock<Option<mpsc::Sender<LogEntry>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

/// Fans log entries out to every configured logger.
pub struct LoggerManager {
    module: String,
    sinks: Vec<LoggerSink>,
}

impl LoggerManager {
    /// Start one worker per logger. `capacity` bounds each logger's queue.
    pub fn new(module: impl Into<String>, loggers: Vec<(String, Arc<dyn Logger>)>, capacity: usize) -> Self {
        Self::with_timeout(module, loggers, capacity, DEFAULT_LOG_TIMEOUT)
    }

    pub fn with_timeout(
        module: impl Into<String>,
        loggers: Vec<(String, Arc<dyn Logger>)>,
        capacity: usize,
        log_timeout: Duration,
    ) -> Self {
        let module = module.into();
        let sinks = loggers
            .into_iter()
            .map(|(id, logger)| {
                let (tx, mut rx) = mpsc::channel::<LogEntry>(capacity.max(1));
                let worker_logger = logger.clone();
                let worker_id = id.clone();
                let worker = tokio::spawn(async move {
                    while let Some(entry) = rx.recv().await {
                        match tokio::time::timeout(log_timeout, worker_logger.log(&entry)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(logger = %worker_id, error = %e, "Logger failed, entry discarded");
                            }
                            Err(_) => {
                                warn!(
                                    logger = %worker_id,
                                    timeout_ms = log_timeout.as_millis() as u64,
                                    "Logger timed out, entry discarded"
                                );
                            }
                        }
                    }
                });
                LoggerSink {
                    id,
                    logger,
                    tx: RwLock::new(Some(tx)),
                    worker: parking_lot::Mutex::new(Some(worker)),
                    dropped: AtomicU64::new(0),
                }
            })
            .collect();

        Self { module, sinks }
    }

    /// Hand an entry to every logger without waiting on any of them.
    pub fn emit(&self, entry: LogEntry) {
        for sink in &self.sinks {
            let guard = sink.tx.read();
            let Some(tx) = guard.as_ref() else {
                continue;
            };
            if let Err(e) = tx.try_send(entry.clone()) {
                let dropped = sink.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    module = %self.module,
                    logger = %sink.id,
                    phase = entry.phase.as_str(),
                    dropped,
                    error = %e,
                    "Logger queue unavailable, entry dropped"
                );
            }
        }
    }

    /// Flush queued entries (bounded by `timeout` per logger) and shut every
    /// logger down. Safe to call more than once.
    pub async fn shutdown(&self, timeout: Duration) {
        for sink in &self.sinks {
            sink.tx.write().take();
            let worker = sink.worker.lock().take();
            if let Some(worker) = worker {
                if tokio::time::timeout(timeout, worker).await.is_err() {
                    warn!(module = %self.module, logger = %sink.id, "Logger did not flush before deadline");
                }
            }
            if let Err(e) = sink.logger.shutdown().await {
                warn!(module = %self.module, logger = %sink.id, error = %e, "Logger shutdown failed");
            }
        }
    }
}

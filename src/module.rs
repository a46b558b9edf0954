//! Module Instance - the live container for one module.
//!
//! Loading resolves every connector through the registry, wires the
//! scheduler, bus, route table, transform pipeline and per-route delivery,
//! and leaves the instance in `loading`. The runtime then starts it
//! (`active`) and eventually unloads it (`unloading` then `removed`).
//!
//! Each bus entry is dispatched to every matching route concurrently. The
//! entry is acknowledged once all of its route-matches have left the
//! pipeline; work still running at the drain deadline is abandoned and left
//! unacknowledged so a durable bus replays it.

use crate::buffer::WebhookBuffer;
use crate::bus::{BusEntry, BusKind, EventBus, MemoryBus, WalBus};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::{EventStoreKind, ModuleDefinition, RuntimeSettings};
use crate::connectors::{merge_config, Actor, Source};
use crate::delivery::{DeliveryError, DeliverySnapshot, RouteDelivery};
use crate::dlq::DeadLetterQueue;
use crate::event::Event;
use crate::logger::{LogEntry, Logger, LoggerManager, Phase, TracingLogger};
use crate::registry::ConnectorRegistry;
use crate::router::{Route, RouteMatcher};
use crate::runtime::RuntimeError;
use crate::scheduler::{Scheduler, SourceHealth, SourceRunner, SourceSettings};
use crate::store::{EventStore, FileEventStore, MemoryEventStore, RouteOutcome, StoredEvent};
use crate::transform::{BoundTransform, PipelineOutcome, Transform, TransformPipeline};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long abandoned tasks get to observe cancellation after the deadline.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

/// How long the logger manager gets to flush at unload.
const LOGGER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Loading,
    Active,
    Unloading,
    Removed,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Loading => "loading",
            ModuleState::Active => "active",
            ModuleState::Unloading => "unloading",
            ModuleState::Removed => "removed",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub name: String,
    pub source: String,
    pub actor: String,
    pub delivery: Option<DeliverySnapshot>,
}

/// Read-only view of a module for the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: String,
    pub state: ModuleState,
    pub loaded_at: DateTime<Utc>,
    pub routes: Vec<RouteStatus>,
    pub sources: BTreeMap<String, SourceHealth>,
    pub bus: BusKind,
    pub bus_pending: usize,
    pub in_flight: usize,
    pub dead_letters: u64,
}

/// Routing half of a module: everything a bus entry touches after the bus.
struct RouteStage {
    module: String,
    matcher: RouteMatcher,
    pipeline: TransformPipeline,
    deliveries: HashMap<String, Arc<RouteDelivery>>,
    bus: Arc<dyn EventBus>,
    logger: Arc<LoggerManager>,
    dlq: Option<DeadLetterQueue>,
    store: Option<Arc<dyn EventStore>>,
}

impl RouteStage {
    fn dispatch(self: &Arc<Self>, entry: BusEntry, abandon: &CancellationToken, tracker: &TaskTracker) {
        let stage = Arc::clone(self);
        let abandon = abandon.clone();
        tracker.spawn(async move { stage.process(entry, abandon).await });
    }

    async fn process(self: Arc<Self>, entry: BusEntry, abandon: CancellationToken) {
        let BusEntry {
            seq,
            event,
            replayed,
        } = entry;

        if replayed {
            self.logger
                .emit(LogEntry::for_event(Phase::BusReplayed, &event).with_meta("seq", json!(seq)));
        }

        let routes = self.matcher.matching(&event);
        if routes.is_empty() {
            debug!(module = %self.module, event_id = %event.id, "No route matched");
            self.logger.emit(LogEntry::for_event(Phase::RouteUnmatched, &event));
            self.ack(seq, &event).await;
            return;
        }

        let mut matches = JoinSet::new();
        for route in routes {
            self.logger.emit(
                LogEntry::for_event(Phase::RouteMatched, &event)
                    .with_route(&route.name)
                    .with_target(&route.target.actor),
            );
            let stage = Arc::clone(&self);
            let event = event.clone();
            matches.spawn(async move { stage.run_route(route, event).await });
        }

        let finished = tokio::select! {
            () = abandon.cancelled() => false,
            () = async {
                while let Some(joined) = matches.join_next().await {
                    if let Err(e) = joined {
                        error!(module = %self.module, event_id = %event.id, error = %e, "Route task failed");
                        self.logger.emit(
                            LogEntry::for_event(Phase::SystemError, &event)
                                .with_error(e.to_string())
                                .with_meta("fatal", json!(false)),
                        );
                    }
                }
            } => true,
        };

        if finished {
            self.ack(seq, &event).await;
        } else {
            let pending = matches.len();
            matches.abort_all();
            warn!(module = %self.module, event_id = %event.id, seq, pending, "Pipeline abandoned at drain deadline");
            self.logger.emit(
                LogEntry::for_event(Phase::PipelineAbandoned, &event)
                    .with_meta("seq", json!(seq))
                    .with_meta("pendingRoutes", json!(pending)),
            );
        }
    }

    async fn run_route(&self, route: Arc<Route>, event: Event) -> RouteOutcome {
        let (outcome, last_event) = match self.pipeline.run(&route, event.clone(), &self.logger).await {
            PipelineOutcome::Deliver(transformed) => {
                let outcome = self.deliver(&route, &transformed).await;
                (outcome, transformed)
            }
            PipelineOutcome::Dropped { .. } => (RouteOutcome::Dropped, event),
            PipelineOutcome::Halted { .. } => (RouteOutcome::Halted, event),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store
                .record(&StoredEvent::new(&route.name, outcome, last_event))
                .await
            {
                warn!(module = %self.module, route = %route.name, error = %e, "Event store write failed");
            }
        }
        outcome
    }

    async fn deliver(&self, route: &Route, event: &Event) -> RouteOutcome {
        let Some(delivery) = self.deliveries.get(&route.name) else {
            let error = format!("no delivery wired for route '{}'", route.name);
            self.logger.emit(
                LogEntry::for_event(Phase::SystemError, event)
                    .with_route(&route.name)
                    .with_error(&error)
                    .with_meta("fatal", json!(false)),
            );
            return RouteOutcome::Failed;
        };

        match delivery.deliver(event, &self.logger).await {
            Ok(_) => RouteOutcome::Delivered,
            Err(DeliveryError::Rejected(_)) => RouteOutcome::Rejected,
            Err(e) => {
                if e.is_dead_letter() {
                    self.dead_letter(delivery, event, &e).await;
                }
                RouteOutcome::Failed
            }
        }
    }

    async fn dead_letter(&self, delivery: &RouteDelivery, event: &Event, failure: &DeliveryError) {
        let Some(dlq) = &self.dlq else {
            return;
        };
        if let Err(e) = dlq
            .add_failed_event(
                event,
                delivery.route(),
                delivery.actor_id(),
                &failure.to_string(),
                failure.attempts(),
            )
            .await
        {
            error!(module = %self.module, route = %delivery.route(), error = %e, "Dead letter write failed");
            self.logger.emit(
                LogEntry::for_event(Phase::SystemError, event)
                    .with_route(delivery.route())
                    .with_error(e.to_string())
                    .with_meta("fatal", json!(false)),
            );
        }
    }

    async fn ack(&self, seq: u64, event: &Event) {
        match self.bus.ack(seq).await {
            Ok(()) => {
                self.logger
                    .emit(LogEntry::for_event(Phase::BusAcked, event).with_meta("seq", json!(seq)));
            }
            Err(e) => {
                warn!(module = %self.module, seq, error = %e, "Bus ack failed");
                self.logger.emit(
                    LogEntry::for_event(Phase::SystemError, event)
                        .with_error(format!("ack {} failed: {}", seq, e))
                        .with_meta("fatal", json!(false)),
                );
            }
        }
    }
}

/// One loaded module.
pub struct ModuleInstance {
    name: String,
    definition: ModuleDefinition,
    state: RwLock<ModuleState>,
    loaded_at: DateTime<Utc>,
    drain_timeout: Duration,
    scheduler: Scheduler,
    sources: Vec<(String, Arc<dyn Source>)>,
    actors: Vec<(String, Arc<dyn Actor>)>,
    stage: Arc<RouteStage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<BusEntry>>>,
    intake: CancellationToken,
    abandon: CancellationToken,
    pipelines: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ModuleInstance {
    /// Resolve and initialise every part of `definition`. The instance is
    /// left in `loading`; nothing runs until [`start`](Self::start).
    ///
    /// If any part fails, everything already initialised is shut down again
    /// and a fatal `system.error` is logged before the error is returned.
    pub async fn build(
        definition: ModuleDefinition,
        settings: &RuntimeSettings,
        registry: &ConnectorRegistry,
    ) -> Result<Self, RuntimeError> {
        definition.validate()?;
        let name = definition.name.clone();

        let mut created = Created::default();
        match Self::assemble(definition, settings, registry, &mut created).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                error!(module = %name, error = %e, "Module failed to build");
                created.release(&name, &e).await;
                Err(e)
            }
        }
    }

    async fn assemble(
        definition: ModuleDefinition,
        settings: &RuntimeSettings,
        registry: &ConnectorRegistry,
        created: &mut Created,
    ) -> Result<Self, RuntimeError> {
        let name = definition.name.clone();

        let logger = Arc::new(build_loggers(&definition, settings, registry).await?);
        created.logger = Some(Arc::clone(&logger));

        let mut bound = Vec::with_capacity(definition.transforms.len());
        for (id, def) in &definition.transforms {
            let mut transform = registry.create_transform(&def.kind)?;
            transform
                .init(&def.config)
                .await
                .map_err(|e| RuntimeError::init("transform", id, e))?;
            let transform: Arc<dyn Transform> = Arc::from(transform);
            created.transforms.push((id.clone(), Arc::clone(&transform)));
            let mut step = BoundTransform::new(id, transform).with_on_error(def.on_error);
            if let Some(ms) = def.timeout_ms {
                step = step.with_timeout(Duration::from_millis(ms));
            }
            bound.push(step);
        }
        let pipeline = TransformPipeline::new(bound, settings.default_transform_timeout());

        let mut actors: BTreeMap<String, Arc<dyn Actor>> = BTreeMap::new();
        for (id, def) in &definition.actors {
            let mut actor = registry.create_actor(&def.kind)?;
            actor
                .init(&def.config)
                .await
                .map_err(|e| RuntimeError::init("actor", id, e))?;
            let actor: Arc<dyn Actor> = Arc::from(actor);
            created.actors.push((id.clone(), Arc::clone(&actor)));
            actors.insert(id.clone(), actor);
        }

        let matcher = RouteMatcher::from_definitions(&definition.routes)?;
        let mut deliveries = HashMap::with_capacity(matcher.len());
        for route in matcher.routes() {
            let actor_id = &route.target.actor;
            let (Some(actor), Some(actor_def)) = (actors.get(actor_id), definition.actors.get(actor_id)) else {
                return Err(RuntimeError::Internal(format!(
                    "route '{}' targets unknown actor '{}'",
                    route.name, actor_id
                )));
            };
            let delivery = RouteDelivery::new(
                &route.name,
                actor_id,
                Arc::clone(actor),
                merge_config(&actor_def.config, &route.target.config),
                route.target.context.clone(),
                &route.settings,
            );
            deliveries.insert(route.name.clone(), Arc::new(delivery));
        }

        let data_dir = &settings.data_dir;
        let (bus, receiver) = match settings.bus {
            BusKind::Memory => {
                let (bus, rx) = MemoryBus::new();
                let bus: Arc<dyn EventBus> = Arc::new(bus);
                (bus, rx)
            }
            BusKind::Durable => {
                let path = data_dir.join("wal").join(format!("{}.wal", name));
                let (bus, rx) = WalBus::open(path, settings.wal_fsync).await?;
                let bus: Arc<dyn EventBus> = Arc::new(bus);
                (bus, rx)
            }
        };

        created.bus = Some(Arc::clone(&bus));

        // Checkpoints only outlive the process when the bus does too
        let checkpoints: Arc<dyn CheckpointStore> = match settings.bus {
            BusKind::Memory => Arc::new(MemoryCheckpointStore::new()),
            BusKind::Durable => Arc::new(
                FileCheckpointStore::open(data_dir.join("checkpoints").join(format!("{}.json", name)))
                    .await?,
            ),
        };

        let dlq = if settings.dead_letter {
            Some(DeadLetterQueue::open(data_dir.join("dlq").join(format!("{}.jsonl", name))).await?)
        } else {
            None
        };

        let store: Option<Arc<dyn EventStore>> = match settings.event_store {
            EventStoreKind::None => None,
            EventStoreKind::Memory => Some(Arc::new(MemoryEventStore::new())),
            EventStoreKind::File => Some(Arc::new(
                FileEventStore::open(data_dir.join("events").join(format!("{}.jsonl", name))).await?,
            )),
        };

        let mut sources = Vec::with_capacity(definition.sources.len());
        let mut runners = Vec::with_capacity(definition.sources.len());
        for (id, def) in &definition.sources {
            let mut source = registry.create_source(&def.kind)?;
            source
                .init(&def.config)
                .await
                .map_err(|e| RuntimeError::init("source", id, e))?;
            let source: Arc<dyn Source> = Arc::from(source);
            created.sources.push((id.clone(), Arc::clone(&source)));

            let buffer = if source.webhook().is_none() {
                None
            } else if def.persist_buffer {
                let path = data_dir
                    .join("webhooks")
                    .join(&name)
                    .join(format!("{}.jsonl", id));
                Some(Arc::new(WebhookBuffer::persistent(path).await?))
            } else {
                Some(Arc::new(WebhookBuffer::in_memory()))
            };

            runners.push(Arc::new(SourceRunner::new(
                &name,
                id,
                Arc::clone(&source),
                SourceSettings {
                    interval: def.interval(),
                    circuit: def.circuit,
                    webhook_secret: def.webhook_secret.clone(),
                },
                Arc::clone(&checkpoints),
                Arc::clone(&bus),
                buffer,
                Arc::clone(&logger),
            )));
            sources.push((id.clone(), source));
        }

        let stage = Arc::new(RouteStage {
            module: name.clone(),
            matcher,
            pipeline,
            deliveries,
            bus,
            logger,
            dlq,
            store,
        });

        Ok(Self {
            scheduler: Scheduler::new(&name, runners),
            name,
            definition,
            state: RwLock::new(ModuleState::Loading),
            loaded_at: Utc::now(),
            drain_timeout: settings.drain_timeout(),
            sources,
            actors: actors.into_iter().collect(),
            stage,
            receiver: Mutex::new(Some(receiver)),
            intake: CancellationToken::new(),
            abandon: CancellationToken::new(),
            pipelines: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn source_runner(&self, source_id: &str) -> Option<&Arc<SourceRunner>> {
        self.scheduler.runner(source_id)
    }

    pub fn source_health(&self) -> BTreeMap<String, SourceHealth> {
        self.scheduler.health()
    }

    pub fn event_store(&self) -> Option<&Arc<dyn EventStore>> {
        self.stage.store.as_ref()
    }

    pub fn dead_letter_queue(&self) -> Option<&DeadLetterQueue> {
        self.stage.dlq.as_ref()
    }

    pub fn logger(&self) -> &Arc<LoggerManager> {
        &self.stage.logger
    }

    pub fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.name.clone(),
            state: self.state(),
            loaded_at: self.loaded_at,
            routes: self
                .stage
                .matcher
                .routes()
                .iter()
                .map(|route| RouteStatus {
                    name: route.name.clone(),
                    source: route.source.clone(),
                    actor: route.target.actor.clone(),
                    delivery: self.stage.deliveries.get(&route.name).map(|d| d.snapshot()),
                })
                .collect(),
            sources: self.scheduler.health(),
            bus: self.stage.bus.kind(),
            bus_pending: self.stage.bus.pending(),
            in_flight: self.pipelines.len(),
            dead_letters: self.stage.dlq.as_ref().map_or(0, |d| d.count()),
        }
    }

    fn transition(&self, from: ModuleState, to: ModuleState) -> Result<(), RuntimeError> {
        let mut state = self.state.write();
        if *state != from {
            return Err(RuntimeError::InvalidState {
                module: self.name.clone(),
                state: *state,
                expected: from,
            });
        }
        *state = to;
        debug!(module = %self.name, from = %from, to = %to, "Module state changed");
        Ok(())
    }

    /// Start the dispatcher and every source loop: `loading` → `active`.
    pub(crate) fn start(&self) -> Result<(), RuntimeError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::Internal(format!("module '{}' already started", self.name)))?;
        self.transition(ModuleState::Loading, ModuleState::Active)?;

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.stage),
            receiver,
            self.intake.clone(),
            self.abandon.clone(),
            self.pipelines.clone(),
        ));
        *self.dispatcher.lock() = Some(handle);
        self.scheduler.start();

        info!(
            module = %self.name,
            sources = self.sources.len(),
            actors = self.actors.len(),
            routes = self.stage.matcher.len(),
            "Module active"
        );
        self.stage.logger.emit(
            LogEntry::new(Phase::ModuleLoaded, &self.name)
                .with_meta("routes", json!(self.stage.matcher.len()))
                .with_meta("sources", json!(self.sources.len())),
        );
        Ok(())
    }

    /// Drain and close: `active` → `unloading` → `removed`.
    ///
    /// New ticks stop at once. Entries already on the bus and pipelines in
    /// flight get until the drain deadline; anything left is abandoned
    /// without acknowledgement.
    pub(crate) async fn unload(&self) -> Result<(), RuntimeError> {
        self.transition(ModuleState::Active, ModuleState::Unloading)?;
        let deadline = Instant::now() + self.drain_timeout;
        info!(module = %self.name, drain_timeout_ms = self.drain_timeout.as_millis() as u64, "Unloading module");

        self.scheduler
            .stop(deadline.saturating_duration_since(Instant::now()))
            .await;

        self.intake.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(module = %self.name, error = %e, "Dispatcher task failed");
                self.stage.logger.emit(LogEntry::system_error(
                    &self.name,
                    format!("dispatcher task failed: {}", e),
                    true,
                ));
            }
        }

        self.pipelines.close();
        let drained = tokio::time::timeout_at(deadline, self.pipelines.wait()).await.is_ok();
        if !drained {
            warn!(
                module = %self.name,
                in_flight = self.pipelines.len(),
                "Drain deadline reached, abandoning in-flight pipelines"
            );
            self.abandon.cancel();
            if tokio::time::timeout(ABANDON_GRACE, self.pipelines.wait())
                .await
                .is_err()
            {
                warn!(module = %self.name, "Abandoned pipelines did not stop in time");
            }
        }

        self.close_connectors().await;

        self.stage.logger.emit(
            LogEntry::new(Phase::ModuleUnloaded, &self.name).with_meta("drained", json!(drained)),
        );
        self.stage.logger.shutdown(LOGGER_FLUSH_TIMEOUT).await;

        self.transition(ModuleState::Unloading, ModuleState::Removed)?;
        info!(module = %self.name, drained, "Module removed");
        Ok(())
    }

    /// Give up on a module that never became active: log the fatal error,
    /// close everything it opened and mark it `removed`.
    pub(crate) async fn abort(&self, cause: &RuntimeError) {
        self.stage
            .logger
            .emit(LogEntry::system_error(&self.name, cause.to_string(), true));
        self.scheduler.stop(Duration::ZERO).await;
        self.intake.cancel();
        self.close_connectors().await;
        self.stage.logger.shutdown(LOGGER_FLUSH_TIMEOUT).await;
        *self.state.write() = ModuleState::Removed;
    }

    async fn close_connectors(&self) {
        if let Err(e) = self.stage.bus.close().await {
            error!(module = %self.name, error = %e, "Bus close failed");
            self.stage.logger.emit(LogEntry::system_error(
                &self.name,
                format!("bus close failed: {}", e),
                true,
            ));
        }

        self.stage.pipeline.shutdown().await;
        for (id, actor) in &self.actors {
            if let Err(e) = actor.shutdown().await {
                warn!(module = %self.name, actor = %id, error = %e, "Actor shutdown failed");
            }
        }
        for (id, source) in &self.sources {
            if let Err(e) = source.shutdown().await {
                warn!(module = %self.name, source = %id, error = %e, "Source shutdown failed");
            }
        }
    }
}

/// Parts initialised so far by [`ModuleInstance::build`], released again if
/// a later step fails.
#[derive(Default)]
struct Created {
    logger: Option<Arc<LoggerManager>>,
    transforms: Vec<(String, Arc<dyn Transform>)>,
    actors: Vec<(String, Arc<dyn Actor>)>,
    sources: Vec<(String, Arc<dyn Source>)>,
    bus: Option<Arc<dyn EventBus>>,
}

impl Created {
    async fn release(self, module: &str, cause: &RuntimeError) {
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.close().await {
                warn!(module = %module, error = %e, "Bus close failed");
            }
        }
        for (id, transform) in &self.transforms {
            if let Err(e) = transform.shutdown().await {
                warn!(module = %module, transform = %id, error = %e, "Transform shutdown failed");
            }
        }
        for (id, actor) in &self.actors {
            if let Err(e) = actor.shutdown().await {
                warn!(module = %module, actor = %id, error = %e, "Actor shutdown failed");
            }
        }
        for (id, source) in &self.sources {
            if let Err(e) = source.shutdown().await {
                warn!(module = %module, source = %id, error = %e, "Source shutdown failed");
            }
        }
        if let Some(logger) = &self.logger {
            logger.emit(LogEntry::system_error(module, cause.to_string(), true));
            logger.shutdown(LOGGER_FLUSH_TIMEOUT).await;
        }
    }
}

async fn build_loggers(
    definition: &ModuleDefinition,
    settings: &RuntimeSettings,
    registry: &ConnectorRegistry,
) -> Result<LoggerManager, RuntimeError> {
    let mut loggers: Vec<(String, Arc<dyn Logger>)> = Vec::with_capacity(definition.loggers.len().max(1));
    for (id, def) in &definition.loggers {
        let created = match registry.create_logger(&def.kind) {
            Ok(mut logger) => match logger.init(&def.config).await {
                Ok(()) => Ok(logger),
                Err(e) => Err(RuntimeError::init("logger", id, e)),
            },
            Err(e) => Err(e.into()),
        };
        match created {
            Ok(logger) => loggers.push((id.clone(), Arc::from(logger))),
            Err(e) => {
                // Earlier loggers never reach a manager; close them here
                for (id, logger) in &loggers {
                    if let Err(e) = logger.shutdown().await {
                        warn!(module = %definition.name, logger = %id, error = %e, "Logger shutdown failed");
                    }
                }
                return Err(e);
            }
        }
    }
    if loggers.is_empty() {
        loggers.push(("tracing".to_string(), Arc::new(TracingLogger::new())));
    }
    Ok(LoggerManager::new(
        &definition.name,
        loggers,
        settings.logger_queue_capacity,
    ))
}

/// Hand bus entries to the route stage until intake stops, then dispatch
/// whatever is already queued and exit.
async fn dispatch_loop(
    stage: Arc<RouteStage>,
    mut receiver: mpsc::UnboundedReceiver<BusEntry>,
    intake: CancellationToken,
    abandon: CancellationToken,
    pipelines: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;
            () = intake.cancelled() => {
                while let Ok(entry) = receiver.try_recv() {
                    stage.dispatch(entry, &abandon, &pipelines);
                }
                break;
            }
            entry = receiver.recv() => match entry {
                Some(entry) => stage.dispatch(entry, &abandon, &pipelines),
                None => break,
            },
        }
    }
    debug!(module = %stage.module, "Dispatcher stopped");
}

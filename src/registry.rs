//! Connector Registry - name-keyed factories per role.
//!
//! A module definition names connector types (`type = "webhook"`); the
//! registry maps each name to a factory, once, when the module loads. There
//! is no runtime type inspection: a role is a trait, a type is a key.

use crate::config::ConfigError;
use crate::connectors::{Actor, FileSource, LogActor, Source, WebhookActor, WebhookSource};
use crate::logger::{JsonlLogger, Logger, MemoryLogger, TracingLogger};
use crate::transform::{DedupTransform, EnrichTransform, FilterTransform, Transform};
use std::collections::HashMap;
use std::sync::Arc;

pub type SourceFactory = Arc<dyn Fn() -> Box<dyn Source> + Send + Sync>;
pub type ActorFactory = Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>;
pub type TransformFactory = Arc<dyn Fn() -> Box<dyn Transform> + Send + Sync>;
pub type LoggerFactory = Arc<dyn Fn() -> Box<dyn Logger> + Send + Sync>;

/// Registry of available connector, transform and logger types
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, SourceFactory>,
    actors: HashMap<String, ActorFactory>,
    transforms: HashMap<String, TransformFactory>,
    loggers: HashMap<String, LoggerFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_source("file", || Box::new(FileSource::new()))
            .register_source("webhook", || Box::new(WebhookSource::new()))
            .register_actor("log", || Box::new(LogActor::new()))
            .register_actor("webhook", || Box::new(WebhookActor::new()))
            .register_transform("filter", || Box::new(FilterTransform::new()))
            .register_transform("enrich", || Box::new(EnrichTransform::new()))
            .register_transform("dedup", || Box::new(DedupTransform::new()))
            .register_logger("tracing", || Box::new(TracingLogger::new()))
            .register_logger("jsonl", || Box::new(JsonlLogger::new()))
            .register_logger("memory", || Box::new(MemoryLogger::default()));
        registry
    }

    pub fn register_source<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Source> + Send + Sync + 'static,
    {
        self.sources.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn register_actor<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Actor> + Send + Sync + 'static,
    {
        self.actors.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn register_transform<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    {
        self.transforms.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn register_logger<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Logger> + Send + Sync + 'static,
    {
        self.loggers.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn create_source(&self, kind: &str) -> Result<Box<dyn Source>, ConfigError> {
        self.sources
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| unknown("source", kind))
    }

    pub fn create_actor(&self, kind: &str) -> Result<Box<dyn Actor>, ConfigError> {
        self.actors
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| unknown("actor", kind))
    }

    pub fn create_transform(&self, kind: &str) -> Result<Box<dyn Transform>, ConfigError> {
        self.transforms
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| unknown("transform", kind))
    }

    pub fn create_logger(&self, kind: &str) -> Result<Box<dyn Logger>, ConfigError> {
        self.loggers
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| unknown("logger", kind))
    }

    /// Registered type names per role, sorted.
    pub fn kinds(&self) -> RegisteredKinds {
        fn sorted<V>(map: &HashMap<String, V>) -> Vec<String> {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        }
        RegisteredKinds {
            sources: sorted(&self.sources),
            actors: sorted(&self.actors),
            transforms: sorted(&self.transforms),
            loggers: sorted(&self.loggers),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKinds {
    pub sources: Vec<String>,
    pub actors: Vec<String>,
    pub transforms: Vec<String>,
    pub loggers: Vec<String>,
}

fn unknown(role: &str, kind: &str) -> ConfigError {
    ConfigError::ValidationError(format!("unknown {} type '{}'", role, kind))
}

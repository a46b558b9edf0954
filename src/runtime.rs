//! Runtime - the single owner of every loaded module.
//!
//! Modules are keyed by name. Only [`Runtime::load`], [`Runtime::unload`]
//! and [`Runtime::reload`] change the set or a module's lifecycle state;
//! they are serialized by one lifecycle lock so a name can never be bound
//! twice, while readers (status, webhook lookups) only take the map's read
//! lock.

use crate::buffer::BufferError;
use crate::bus::BusError;
use crate::checkpoint::CheckpointError;
use crate::config::{ConfigError, ModuleDefinition, RuntimeSettings};
use crate::dlq::DlqError;
use crate::module::{ModuleInstance, ModuleState, ModuleStatus};
use crate::registry::ConnectorRegistry;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("module '{0}' is already loaded")]
    ModuleConflict(String),

    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("module '{module}' is {state}, expected {expected}")]
    InvalidState {
        module: String,
        state: ModuleState,
        expected: ModuleState,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{role} '{id}' failed to initialize: {error}")]
    Init {
        role: &'static str,
        id: String,
        error: String,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    DeadLetter(#[from] DlqError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub(crate) fn init(role: &'static str, id: &str, error: impl fmt::Display) -> Self {
        RuntimeError::Init {
            role,
            id: id.to_string(),
            error: error.to_string(),
        }
    }
}

/// Runtime-wide status for the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub uptime: String,
    pub modules: Vec<ModuleStatus>,
}

pub struct Runtime {
    settings: RuntimeSettings,
    registry: ConnectorRegistry,
    modules: RwLock<HashMap<String, Arc<ModuleInstance>>>,
    lifecycle: tokio::sync::Mutex<()>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Runtime {
    pub fn new(settings: RuntimeSettings, registry: ConnectorRegistry) -> Self {
        Self {
            settings,
            registry,
            modules: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn module(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules.read().get(name).cloned()
    }

    /// Loaded module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build, register and start a module. A name already present fails
    /// with [`RuntimeError::ModuleConflict`] and leaves the existing module
    /// untouched.
    pub async fn load(&self, definition: ModuleDefinition) -> Result<Arc<ModuleInstance>, RuntimeError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.load_locked(definition).await
    }

    /// Drain and remove a module.
    pub async fn unload(&self, name: &str) -> Result<(), RuntimeError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.unload_locked(name).await
    }

    /// Unload then load under one lifecycle lock. Other modules keep
    /// running throughout.
    pub async fn reload(&self, definition: ModuleDefinition) -> Result<Arc<ModuleInstance>, RuntimeError> {
        let _lifecycle = self.lifecycle.lock().await;
        definition.validate()?;
        self.unload_locked(&definition.name).await?;
        self.load_locked(definition).await
    }

    async fn load_locked(&self, definition: ModuleDefinition) -> Result<Arc<ModuleInstance>, RuntimeError> {
        let name = definition.name.clone();
        if self.modules.read().contains_key(&name) {
            warn!(module = %name, "Module already loaded");
            return Err(RuntimeError::ModuleConflict(name));
        }

        let instance = Arc::new(ModuleInstance::build(definition, &self.settings, &self.registry).await?);
        self.modules.write().insert(name.clone(), Arc::clone(&instance));

        if let Err(e) = instance.start() {
            error!(module = %name, error = %e, "Module failed to start");
            self.modules.write().remove(&name);
            instance.abort(&e).await;
            return Err(e);
        }
        info!(module = %name, "Module loaded");
        Ok(instance)
    }

    async fn unload_locked(&self, name: &str) -> Result<(), RuntimeError> {
        let instance = self
            .module(name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_string()))?;
        let result = instance.unload().await;
        self.modules.write().remove(name);
        if let Err(e) = &result {
            warn!(module = %name, error = %e, "Module unload did not complete cleanly");
        } else {
            info!(module = %name, "Module unloaded");
        }
        result
    }

    /// Unload every module; used at process shutdown.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let names: Vec<String> = self.modules.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unload_locked(&name).await {
                error!(module = %name, error = %e, "Module unload failed during shutdown");
            }
        }
        info!("Runtime stopped");
    }

    pub fn status(&self) -> RuntimeStatus {
        let mut modules: Vec<ModuleStatus> = self.modules.read().values().map(|m| m.status()).collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        let uptime_seconds = self.started.elapsed().as_secs();
        RuntimeStatus {
            started_at: self.started_at,
            uptime_seconds,
            uptime: format_uptime(uptime_seconds),
            modules,
        }
    }
}

/// Render seconds as "2d 3h 4m 5s", dropping leading zero units.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3_725), "1h 2m 5s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }

    fn module(name: &str) -> ModuleDefinition {
        ModuleDefinition::from_toml_str(&format!(
            r#"
name = "{name}"

[sources.hooks]
type = "webhook"

[actors.out]
type = "log"

[[routes]]
name = "all"
when = {{ source = "hooks", events = ["post"] }}
then = {{ actor = "out" }}
"#
        ))
        .unwrap()
    }

    fn runtime(dir: &std::path::Path) -> Runtime {
        Runtime::new(
            RuntimeSettings {
                data_dir: dir.to_path_buf(),
                drain_timeout_ms: 1_000,
                ..RuntimeSettings::default()
            },
            ConnectorRegistry::with_builtins(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts_without_touching_existing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());

        let first = runtime.load(module("github")).await.unwrap();
        let loaded_at = first.loaded_at();

        let err = runtime.load(module("github")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleConflict(ref name) if name == "github"));

        let current = runtime.module("github").unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.state(), ModuleState::Active);
        assert_eq!(current.loaded_at(), loaded_at);
        assert_eq!(current.status().routes.len(), 1);

        runtime.shutdown().await;
        assert_eq!(first.state(), ModuleState::Removed);
        assert!(runtime.module_names().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        assert!(matches!(
            runtime.unload("nope").await,
            Err(RuntimeError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_replaces_only_target_module() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());

        let a = runtime.load(module("a")).await.unwrap();
        let b = runtime.load(module("b")).await.unwrap();

        let reloaded = runtime.reload(module("a")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &reloaded));
        assert_eq!(a.state(), ModuleState::Removed);
        assert_eq!(reloaded.state(), ModuleState::Active);

        assert!(Arc::ptr_eq(&b, &runtime.module("b").unwrap()));
        assert_eq!(b.state(), ModuleState::Active);
        assert_eq!(runtime.module_names(), vec!["a", "b"]);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_of_missing_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        assert!(matches!(
            runtime.reload(module("ghost")).await,
            Err(RuntimeError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_lists_modules() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        runtime.load(module("z")).await.unwrap();
        runtime.load(module("a")).await.unwrap();

        let status = runtime.status();
        let names: Vec<&str> = status.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert!(status.modules[0].sources.contains_key("hooks"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["modules"][0]["state"], "active");
        assert!(json["uptimeSeconds"].is_u64());

        runtime.shutdown().await;
    }
}

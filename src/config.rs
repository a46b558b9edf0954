//! Configuration module for Tributary.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${TRIBUTARY_API_KEY}"
//!
//! [runtime]
//! data_dir = "data"
//! bus = "durable"
//!
//! [[modules]]
//! name = "github"
//!
//! [modules.sources.hooks]
//! type = "webhook"
//! webhook_secret = "${GITHUB_WEBHOOK_SECRET}"
//!
//! [modules.actors.notify]
//! type = "webhook"
//! config = { url = "https://hooks.example.com/in" }
//!
//! [[modules.routes]]
//! name = "issues"
//! when = { source = "hooks", events = ["issue"] }
//! then = { actor = "notify" }
//! ```

use crate::bus::BusKind;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::router::RouteDefinition;
use crate::transform::ErrorPolicy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TributaryConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on `/status` when set
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Where processed events are recorded, if anywhere.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventStoreKind {
    #[default]
    None,
    Memory,
    File,
}

/// Runtime-wide settings
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeSettings {
    /// Root for WAL, checkpoints, DLQ, event store and webhook buffers
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub bus: BusKind,

    /// How long unload waits for in-flight pipelines
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_transform_timeout_ms")]
    pub default_transform_timeout_ms: u64,

    #[serde(default)]
    pub event_store: EventStoreKind,

    /// Write failed deliveries to `data_dir/dlq/<module>.jsonl`
    #[serde(default = "default_true")]
    pub dead_letter: bool,

    /// `sync_data` after every WAL record
    #[serde(default)]
    pub wal_fsync: bool,

    #[serde(default = "default_logger_queue_capacity")]
    pub logger_queue_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bus: BusKind::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
            default_transform_timeout_ms: default_transform_timeout_ms(),
            event_store: EventStoreKind::default(),
            dead_letter: true,
            wal_fsync: false,
            logger_queue_capacity: default_logger_queue_capacity(),
        }
    }
}

impl RuntimeSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn default_transform_timeout(&self) -> Duration {
        Duration::from_millis(self.default_transform_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_transform_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_logger_queue_capacity() -> usize {
    1024
}

/// A source declared by a module.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceDefinition {
    /// Connector type, resolved through the registry
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default)]
    pub config: Value,

    /// Poll circuit breaker
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    /// HMAC secret for signed webhook deliveries
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Mirror the webhook buffer to disk
    #[serde(default)]
    pub persist_buffer: bool,
}

impl SourceDefinition {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_interval_ms() -> u64 {
    60_000
}

/// An actor declared by a module.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ActorDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub config: Value,
}

/// A transform instance declared by a module.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransformDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub config: Value,

    /// Default error policy; a route may override it per step
    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Overrides the runtime's default step timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A logger declared by a module.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggerDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub config: Value,
}

/// A named bundle of sources, actors, transforms, loggers and routes.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModuleDefinition {
    pub name: String,

    #[serde(default)]
    pub sources: BTreeMap<String, SourceDefinition>,

    #[serde(default)]
    pub actors: BTreeMap<String, ActorDefinition>,

    #[serde(default)]
    pub transforms: BTreeMap<String, TransformDefinition>,

    #[serde(default)]
    pub loggers: BTreeMap<String, LoggerDefinition>,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    /// Free-form module parameters
    #[serde(default)]
    pub params: Value,
}

impl ModuleDefinition {
    /// Parse a single module definition (the body of one `[[modules]]`).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let definition: ModuleDefinition = toml::from_str(&content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate references and policy bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("modules.name".to_string()));
        }

        for (id, source) in &self.sources {
            if source.interval_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Module '{}' source '{}' interval_ms must be > 0",
                    self.name, id
                )));
            }
            if source.circuit.failure_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Module '{}' source '{}' circuit.failure_threshold must be >= 1",
                    self.name, id
                )));
            }
            if let Some(secret) = &source.webhook_secret {
                if secret.contains("${") {
                    warn!(
                        module = %self.name,
                        source = %id,
                        "Webhook secret contains unsubstituted environment variable"
                    );
                }
            }
        }

        for (id, actor) in &self.actors {
            if actor.kind == "webhook" {
                if let Some(url) = actor.config.get("url").and_then(Value::as_str) {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(ConfigError::ValidationError(format!(
                            "Module '{}' webhook actor '{}' URL must start with http:// or https://",
                            self.name, id
                        )));
                    }
                }
            }
        }

        let mut route_names = HashSet::new();
        for route in &self.routes {
            if !route_names.insert(route.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Module '{}' has duplicate route name '{}'",
                    self.name, route.name
                )));
            }
            if !self.sources.contains_key(&route.when.source) {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' references undefined source '{}'",
                    route.name, route.when.source
                )));
            }
            if !self.actors.contains_key(&route.then.actor) {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' references undefined actor '{}'",
                    route.name, route.then.actor
                )));
            }
            for step in &route.transforms {
                if !self.transforms.contains_key(step.name()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Route '{}' references undefined transform '{}'",
                        route.name,
                        step.name()
                    )));
                }
            }
            if route.when.events.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' must list at least one event type",
                    route.name
                )));
            }
            if route.advanced.retry.max_attempts == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' retry.max_attempts must be >= 1",
                    route.name
                )));
            }
            if route.advanced.circuit.failure_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' circuit.failure_threshold must be >= 1",
                    route.name
                )));
            }
            if route.advanced.queue_depth == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' queue_depth must be >= 1",
                    route.name
                )));
            }
        }

        Ok(())
    }
}

impl TributaryConfig {
    /// Load configuration from the default path or TRIBUTARY_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("TRIBUTARY_CONFIG").unwrap_or_else(|_| "config/tributary.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;

        info!(
            modules = config.modules.len(),
            bus = ?config.runtime.bus,
            data_dir = %config.runtime.data_dir.display(),
            "Configuration loaded"
        );

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;

        debug!("Parsing TOML configuration");
        let config: TributaryConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.logger_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.logger_queue_capacity must be >= 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for module in &self.modules {
            if !names.insert(module.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate module name '{}'",
                    module.name
                )));
            }
            module.validate()?;
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    const MODULE: &str = r#"
        name = "github"

        [sources.hooks]
        type = "webhook"
        webhook_secret = "s3cret"
        circuit = { failure_threshold = 3, cooldown_ms = 10000 }

        [actors.notify]
        type = "webhook"
        config = { url = "https://example.com/in" }

        [transforms.once]
        type = "dedup"
        on_error = "drop"
        timeout_ms = 250

        [[routes]]
        name = "issues"
        transforms = ["once", { name = "once", on_error = "halt" }]
        when = { source = "hooks", events = ["issue", "pull_request"], filter = { "payload.action" = "opened" } }
        then = { actor = "notify", context = "triage" }
        advanced = { max_rate = 5.0, queue_depth = 100, retry = { max_attempts = 4, backoff = "linear" } }
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TRIBUTARY_TEST_VAR", "substituted_value");
        let input = "url = \"${TRIBUTARY_TEST_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("TRIBUTARY_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input).unwrap();
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            port = 4000
        "#;

        let config = TributaryConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.runtime.bus, BusKind::Memory);
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = TributaryConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.runtime.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.runtime.default_transform_timeout(), Duration::from_secs(5));
        assert!(config.runtime.dead_letter);
        assert_eq!(config.runtime.event_store, EventStoreKind::None);
    }

    #[test]
    fn test_parse_module() {
        let module = ModuleDefinition::from_toml_str(MODULE).unwrap();
        assert_eq!(module.name, "github");

        let hooks = &module.sources["hooks"];
        assert_eq!(hooks.kind, "webhook");
        assert_eq!(hooks.interval(), Duration::from_secs(60));
        assert_eq!(hooks.circuit.failure_threshold, 3);
        assert_eq!(hooks.circuit.cooldown(), Duration::from_secs(10));

        let once = &module.transforms["once"];
        assert_eq!(once.on_error, ErrorPolicy::Drop);
        assert_eq!(once.timeout_ms, Some(250));

        let route = &module.routes[0];
        assert_eq!(route.when.events, vec![EventType::Issue, EventType::PullRequest]);
        assert_eq!(route.transforms[1].on_error(), Some(ErrorPolicy::Halt));
        assert_eq!(route.then.context.as_deref(), Some("triage"));
        assert_eq!(route.advanced.max_rate, Some(5.0));
        assert_eq!(route.advanced.retry.max_attempts, 4);
    }

    #[test]
    fn test_parse_runtime_section() {
        let toml = r#"
            [runtime]
            data_dir = "/var/lib/tributary"
            bus = "durable"
            event_store = "file"
            wal_fsync = true
            drain_timeout_ms = 1000
        "#;
        let config = TributaryConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.runtime.bus, BusKind::Durable);
        assert_eq!(config.runtime.event_store, EventStoreKind::File);
        assert!(config.runtime.wal_fsync);
        assert_eq!(config.runtime.drain_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_validation_undefined_actor() {
        let toml = MODULE.replace("actor = \"notify\"", "actor = \"missing\"");
        assert!(matches!(
            ModuleDefinition::from_toml_str(&toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_invalid_url() {
        let toml = MODULE.replace("https://example.com/in", "not-a-url");
        assert!(ModuleDefinition::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_validation_zero_attempts() {
        let toml = MODULE.replace("max_attempts = 4", "max_attempts = 0");
        assert!(ModuleDefinition::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_unknown_event_type_is_parse_error() {
        let toml = MODULE.replace("\"pull_request\"", "\"pull\"");
        assert!(matches!(
            ModuleDefinition::from_toml_str(&toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_duplicate_module_names() {
        let toml = r#"
            [[modules]]
            name = "a"
            [[modules]]
            name = "a"
        "#;
        assert!(TributaryConfig::from_toml_str(toml).is_err());
    }
}

//! Built-in transforms: `filter`, `enrich`, `dedup`.
//!
//! ```toml
//! [modules.transforms.humans-only]
//! type = "filter"
//! config = { criteria = { "provenance.author.kind" = "human" } }
//!
//! [modules.transforms.tag]
//! type = "enrich"
//! config = { fields = { "team" = "core", "meta.routed" = true } }
//!
//! [modules.transforms.once]
//! type = "dedup"
//! config = { key = "payload.url", window = 5000 }
//! ```

use super::{Transform, TransformContext, TransformError};
use crate::event::{lookup_path, set_path, Event};
use crate::router::{Filter, FilterCriterion};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Drops events unless every dot-path criterion holds.
#[derive(Debug, Default)]
pub struct FilterTransform {
    filter: Filter,
}

impl FilterTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transform for FilterTransform {
    fn name(&self) -> &str {
        "filter"
    }

    async fn init(&mut self, config: &Value) -> Result<(), TransformError> {
        let criteria: BTreeMap<String, FilterCriterion> = match config.get("criteria") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| TransformError::Init(format!("invalid filter criteria: {}", e)))?,
            None => BTreeMap::new(),
        };
        self.filter = Filter::compile(&criteria).map_err(|e| TransformError::Init(e.to_string()))?;
        Ok(())
    }

    async fn execute(
        &self,
        event: &Event,
        _context: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        if self.filter.matches(event) {
            Ok(Some(event.clone()))
        } else {
            Ok(None)
        }
    }
}

/// Sets fixed values at dot-paths inside the payload.
#[derive(Debug, Default)]
pub struct EnrichTransform {
    fields: Map<String, Value>,
}

impl EnrichTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transform for EnrichTransform {
    fn name(&self) -> &str {
        "enrich"
    }

    async fn init(&mut self, config: &Value) -> Result<(), TransformError> {
        match config.get("fields") {
            Some(Value::Object(fields)) => {
                self.fields = fields.clone();
                Ok(())
            }
            Some(_) => Err(TransformError::Init("enrich 'fields' must be a table".into())),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        event: &Event,
        _context: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        let mut payload = event.payload.clone();
        for (path, value) in &self.fields {
            if !set_path(&mut payload, path, value.clone()) {
                return Err(TransformError::Failed(format!(
                    "cannot set '{}': an intermediate value is not an object",
                    path
                )));
            }
        }
        Ok(Some(event.with_payload(payload)))
    }
}

const DEFAULT_DEDUP_WINDOW: usize = 10_000;

#[derive(Default)]
struct SeenKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

/// Drops events whose key was already seen within the last `window` keys.
///
/// The key is a dot-path into the event envelope (default `id`). Events
/// without the key pass through untouched. Each route keeps its own window,
/// so one event fanned out to several routes passes every one of them once.
pub struct DedupTransform {
    key: String,
    window: usize,
    seen: Mutex<HashMap<String, SeenKeys>>,
}

impl DedupTransform {
    pub fn new() -> Self {
        Self {
            key: "id".to_string(),
            window: DEFAULT_DEDUP_WINDOW,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` for `route`; returns `true` if it was already present.
    fn check_and_insert(&self, route: &str, key: String) -> bool {
        let mut routes = self.seen.lock();
        let seen = routes.entry(route.to_string()).or_default();
        if seen.keys.contains(&key) {
            return true;
        }
        seen.keys.insert(key.clone());
        seen.order.push_back(key);
        while seen.order.len() > self.window {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
        false
    }
}

impl Default for DedupTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transform for DedupTransform {
    fn name(&self) -> &str {
        "dedup"
    }

    async fn init(&mut self, config: &Value) -> Result<(), TransformError> {
        if let Some(key) = config.get("key").and_then(Value::as_str) {
            if key.is_empty() {
                return Err(TransformError::Init("dedup 'key' must not be empty".into()));
            }
            self.key = key.to_string();
        }
        if let Some(window) = config.get("window").and_then(Value::as_u64) {
            self.window = (window as usize).max(1);
        }
        Ok(())
    }

    async fn execute(
        &self,
        event: &Event,
        context: &TransformContext,
    ) -> Result<Option<Event>, TransformError> {
        let document = serde_json::to_value(event)
            .map_err(|e| TransformError::Failed(e.to_string()))?;
        let key = match lookup_path(&document, &self.key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => return Ok(Some(event.clone())),
            Some(other) => other.to_string(),
        };

        if self.check_and_insert(&context.route_name, key) {
            Ok(None)
        } else {
            Ok(Some(event.clone()))
        }
    }
}

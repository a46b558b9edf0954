//! Core event types for Tributary.
//!
//! The [`Event`] struct is the immutable envelope that flows from a source,
//! through the bus and route matcher, into transform chains and finally to an
//! actor. Transforms never mutate an event in place: they return a new value
//! (see [`Event::with_payload`]) or `None` to drop it.
//!
//! # Wire shape
//!
//! The envelope serializes to a flat, field-stable JSON object. The same shape
//! is written to the write-ahead log, the event store, dead letters, and is
//! posted by the webhook actor, so renaming a field is a breaking change.
//!
//! ```json
//! {
//!   "id": "0b7c5f7e-7d59-4c1e-9f0e-2a3f2f5d2c11",
//!   "timestamp": "2025-12-11T10:00:00Z",
//!   "source": "github",
//!   "type": "issue",
//!   "provenance": {
//!     "platform": "github",
//!     "platformType": "issues.opened",
//!     "author": { "id": "42", "name": "octocat", "kind": "human" }
//!   },
//!   "payload": { "title": "Crash on startup" },
//!   "traceId": "5f0c9a2e-3f1b-4a54-8d0d-6c1f9f4b7a10",
//!   "module": "community"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised when an event fails shape validation at ingestion.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The fixed set of activity types a source may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Post,
    Reply,
    Mention,
    Message,
    Reaction,
    Follow,
    Issue,
    PullRequest,
    Commit,
    Release,
    Alert,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::Post,
        EventType::Reply,
        EventType::Mention,
        EventType::Message,
        EventType::Reaction,
        EventType::Follow,
        EventType::Issue,
        EventType::PullRequest,
        EventType::Commit,
        EventType::Release,
        EventType::Alert,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Post => "post",
            EventType::Reply => "reply",
            EventType::Mention => "mention",
            EventType::Message => "message",
            EventType::Reaction => "reaction",
            EventType::Follow => "follow",
            EventType::Issue => "issue",
            EventType::PullRequest => "pull_request",
            EventType::Commit => "commit",
            EventType::Release => "release",
            EventType::Alert => "alert",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SchemaError::InvalidField {
                field: "type",
                reason: format!("unknown event type '{}'", s),
            })
    }
}

/// Classification of whoever caused the activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Human,
    Bot,
    System,
    #[default]
    Unknown,
}

/// Identity of the author on the origin platform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub kind: AuthorKind,
}

/// Where an event came from, beyond the source id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Origin platform (e.g. "github", "discord")
    #[serde(default)]
    pub platform: String,

    /// Platform-specific sub-type (e.g. "issues.opened")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,

    /// Open-ended platform fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Provenance {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Default::default()
        }
    }

    pub fn with_platform_type(mut self, platform_type: impl Into<String>) -> Self {
        self.platform_type = Some(platform_type.into());
        self
    }

    pub fn with_author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }
}

/// An activity event flowing through Tributary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event id
    pub id: Uuid,

    /// UTC creation time
    pub timestamp: DateTime<Utc>,

    /// Id of the source that produced the event
    pub source: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub provenance: Provenance,

    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: Value,

    /// Assigned at creation and carried into every log entry for this event
    pub trace_id: String,

    /// Owning module; stamped by the scheduler at ingestion
    #[serde(default)]
    pub module: String,
}

impl Event {
    /// Create a new event with a fresh id, timestamp and trace id.
    pub fn new(source: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            event_type,
            provenance: Provenance::default(),
            payload,
            trace_id: Uuid::new_v4().to_string(),
            module: String::new(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns a copy of this event carrying a different payload.
    ///
    /// Identity (id, trace id, source, module) is preserved so log entries
    /// produced after a transform still correlate with the original.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Look up a value by dot-path against the serialized envelope.
    ///
    /// Paths address the wire shape, so `payload.title`,
    /// `provenance.author.kind` and `type` all work. Array elements are
    /// addressed by index (`payload.labels.0`).
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        lookup_path(&root, path).cloned()
    }

    /// Check the envelope before it is admitted to the bus.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.id.is_nil() {
            return Err(SchemaError::InvalidField {
                field: "id",
                reason: "nil uuid".to_string(),
            });
        }
        if self.source.trim().is_empty() {
            return Err(SchemaError::MissingField("source"));
        }
        if self.trace_id.trim().is_empty() {
            return Err(SchemaError::MissingField("traceId"));
        }
        if self.module.trim().is_empty() {
            return Err(SchemaError::MissingField("module"));
        }
        match &self.payload {
            Value::Object(_) | Value::Null => Ok(()),
            other => Err(SchemaError::InvalidField {
                field: "payload",
                reason: format!("expected object, got {}", json_kind(other)),
            }),
        }
    }
}

/// Resolve a dot-path inside a JSON value.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a value at a dot-path, creating intermediate objects as needed.
///
/// Returns `false` when an intermediate segment exists but is not an object.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = match segments.pop() {
        Some(last) if !last.is_empty() => last,
        _ => return false,
    };

    if root.is_null() {
        *root = Value::Object(Map::new());
    }

    let mut current = root;
    for segment in segments {
        let map = match current {
            Value::Object(map) => map,
            _ => return false,
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            true
        }
        _ => false,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

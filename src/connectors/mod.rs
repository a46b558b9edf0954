//! Connector contracts for Tributary.
//!
//! Sources produce events, actors receive them. Both are resolved by type
//! name through the [`ConnectorRegistry`](crate::registry::ConnectorRegistry)
//! when a module loads, initialized once with their config block, and shut
//! down when the module unloads.
//!
//! ## Built-in Connectors
//!
//! - [`FileSource`]: tails a JSON-lines file, checkpointed by byte offset
//! - [`WebhookSource`]: receives signed HTTP pushes, buffered until the next tick
//! - [`LogActor`]: structured logging of delivered events
//! - [`WebhookActor`]: HTTP POST to an external URL
//!
//! ## Creating Custom Actors
//!
//! ```rust,ignore
//! use tributary::connectors::{Actor, DeliveryRequest, DeliveryResult};
//! use tributary::Event;
//! use async_trait::async_trait;
//!
//! struct MyActor;
//!
//! #[async_trait]
//! impl Actor for MyActor {
//!     fn name(&self) -> &str {
//!         "my-actor"
//!     }
//!
//!     async fn deliver(&self, event: &Event, request: &DeliveryRequest) -> DeliveryResult {
//!         // Your logic here
//!         DeliveryResult::delivered()
//!     }
//! }
//! ```

pub mod file;
pub mod inbound;
pub mod log;
pub mod webhook;

use crate::event::{Event, EventType, Provenance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub use file::FileSource;
pub use inbound::WebhookSource;
pub use log::LogActor;
pub use webhook::WebhookActor;

/// Errors raised by source and actor connectors.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("connector init failed: {0}")]
    Init(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("webhook payload rejected: {0}")]
    Webhook(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of one poll: new events plus the checkpoint to persist once the
/// bus has accepted them. `None` leaves the stored checkpoint unchanged.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub events: Vec<Event>,
    pub checkpoint: Option<String>,
}

impl PollBatch {
    pub fn new(events: Vec<Event>, checkpoint: Option<String>) -> Self {
        Self { events, checkpoint }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// A connector polled (or pushed to) for new events.
#[async_trait]
pub trait Source: Send + Sync {
    /// Connector type name (e.g. "file")
    fn name(&self) -> &str;

    async fn init(&mut self, _config: &Value) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Fetch everything after `checkpoint`.
    async fn poll(&self, checkpoint: Option<&str>) -> Result<PollBatch, ConnectorError>;

    async fn shutdown(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Sources that accept HTTP pushes return a handler here.
    fn webhook(&self) -> Option<&dyn WebhookHandler> {
        None
    }
}

/// Turns a verified webhook body into events.
pub trait WebhookHandler: Send + Sync {
    /// Header carrying the `sha256=<hex>` body signature.
    fn signature_header(&self) -> &str {
        "x-signature-256"
    }

    fn handle(&self, source_id: &str, body: &[u8]) -> Result<Vec<Event>, ConnectorError>;
}

/// Outcome class of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Permanent; never retried
    Rejected,
    /// Transient; retried per policy
    Error,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Rejected => "rejected",
            DeliveryStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What an actor reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered() -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Rejected,
            error: Some(error.into()),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Error,
            error: Some(error.into()),
        }
    }
}

/// Route-resolved delivery settings handed to the actor with each event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRequest {
    pub route: String,
    /// Actor config merged with the route's delivery config
    pub config: Value,
    /// Optional launch-context text from the route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// A connector that receives delivered events.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Connector type name (e.g. "webhook")
    fn name(&self) -> &str;

    async fn init(&mut self, _config: &Value) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn deliver(&self, event: &Event, request: &DeliveryRequest) -> DeliveryResult;

    async fn shutdown(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Minimal inbound record shape accepted by the built-in sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub provenance: Option<Provenance>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ActivityRecord {
    pub fn into_event(self, source_id: &str) -> Event {
        let mut event = Event::new(source_id, self.event_type, self.payload);
        if let Some(provenance) = self.provenance {
            event = event.with_provenance(provenance);
        }
        if let Some(timestamp) = self.timestamp {
            event = event.with_timestamp(timestamp);
        }
        if let Some(trace_id) = self.trace_id.filter(|t| !t.is_empty()) {
            event = event.with_trace_id(trace_id);
        }
        event
    }
}

/// Shallow-merge `overlay` onto `base` (objects only; otherwise `overlay` wins
/// unless it is null).
pub fn merge_config(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delivery_result_constructors() {
        assert_eq!(DeliveryResult::delivered().status, DeliveryStatus::Delivered);
        let rejected = DeliveryResult::rejected("bad request");
        assert_eq!(rejected.status, DeliveryStatus::Rejected);
        assert_eq!(rejected.error.as_deref(), Some("bad request"));
        assert_eq!(
            serde_json::to_value(DeliveryResult::error("503")).unwrap(),
            json!({"status": "error", "error": "503"})
        );
    }

    #[test]
    fn test_activity_record_into_event() {
        let record: ActivityRecord = serde_json::from_value(json!({
            "type": "mention",
            "payload": {"text": "hi"},
            "provenance": {"platform": "discord"},
            "traceId": "t-9"
        }))
        .unwrap();

        let event = record.into_event("chat");
        assert_eq!(event.source, "chat");
        assert_eq!(event.event_type, EventType::Mention);
        assert_eq!(event.provenance.platform, "discord");
        assert_eq!(event.trace_id, "t-9");
    }

    #[test]
    fn test_merge_config() {
        let merged = merge_config(&json!({"url": "a", "timeout_ms": 5}), &json!({"url": "b"}));
        assert_eq!(merged, json!({"url": "b", "timeout_ms": 5}));
        assert_eq!(merge_config(&json!({"a": 1}), &Value::Null), json!({"a": 1}));
    }
}

//! Log Actor - Structured logging of delivered events.
//!
//! The [`LogActor`] logs every event routed to it through `tracing`. Useful for
//! debugging routes, auditing, and as a default target during development.
//!
//! # Example
//!
//! ```toml
//! [modules.actors.audit]
//! type = "log"
//! config = { prefix = "audit" }
//! ```

use super::{Actor, ConnectorError, DeliveryRequest, DeliveryResult};
use crate::event::Event;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// An actor that logs events using structured logging.
#[derive(Debug, Clone)]
pub struct LogActor {
    /// Prefix for log messages
    prefix: String,
}

impl LogActor {
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    /// The prefix appears in log messages, useful for distinguishing
    /// different log actors (e.g., "audit", "debug", "analytics")
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogActor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actor for LogActor {
    fn name(&self) -> &str {
        "log"
    }

    async fn init(&mut self, config: &Value) -> Result<(), ConnectorError> {
        if let Some(prefix) = config.get("prefix").and_then(Value::as_str) {
            self.prefix = prefix.to_string();
        }
        Ok(())
    }

    async fn deliver(&self, event: &Event, request: &DeliveryRequest) -> DeliveryResult {
        // Route config may override the prefix per delivery
        let prefix = request
            .config
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or(&self.prefix);

        info!(
            prefix = %prefix,
            route = %request.route,
            event_id = %event.id,
            trace_id = %event.trace_id,
            source = %event.source,
            event_type = %event.event_type,
            payload = %event.payload,
            context = ?request.context,
            "[{}] Delivered: {}/{}",
            prefix,
            event.source,
            event.event_type
        );

        DeliveryResult::delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::DeliveryStatus;
    use crate::event::EventType;
    use serde_json::json;

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            route: "r".into(),
            config: json!({}),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_log_actor_delivers() {
        let actor = LogActor::new();
        let event = Event::new("test", EventType::Post, json!({"k": "v"}));

        let result = actor.deliver(&event, &request()).await;
        assert_eq!(result.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_log_actor_prefix_from_config() {
        let mut actor = LogActor::new();
        actor.init(&json!({"prefix": "audit"})).await.unwrap();
        assert_eq!(actor.prefix, "audit");
    }

    #[test]
    fn test_log_actor_name() {
        assert_eq!(LogActor::with_prefix("custom").name(), "log");
    }
}

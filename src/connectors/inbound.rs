//! Webhook Source - events pushed over HTTP.
//!
//! Polling yields nothing; the control server verifies the request signature,
//! hands the body to [`WebhookHandler::handle`], and the scheduler drains the
//! resulting events from the source's buffer on its next tick.
//!
//! The body is one [`ActivityRecord`] or an array of them.

use super::{ActivityRecord, ConnectorError, PollBatch, Source, WebhookHandler};
use crate::event::Event;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct WebhookSource {
    signature_header: String,
}

impl WebhookSource {
    pub fn new() -> Self {
        Self {
            signature_header: "x-signature-256".to_string(),
        }
    }
}

impl Default for WebhookSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for WebhookSource {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn init(&mut self, config: &Value) -> Result<(), ConnectorError> {
        if let Some(header) = config.get("signature_header").and_then(Value::as_str) {
            self.signature_header = header.to_ascii_lowercase();
        }
        Ok(())
    }

    async fn poll(&self, _checkpoint: Option<&str>) -> Result<PollBatch, ConnectorError> {
        Ok(PollBatch::empty())
    }

    fn webhook(&self) -> Option<&dyn WebhookHandler> {
        Some(self)
    }
}

impl WebhookHandler for WebhookSource {
    fn signature_header(&self) -> &str {
        &self.signature_header
    }

    fn handle(&self, source_id: &str, body: &[u8]) -> Result<Vec<Event>, ConnectorError> {
        let value: Value = serde_json::from_slice(body)?;
        let records: Vec<ActivityRecord> = match value {
            Value::Array(_) => serde_json::from_value(value)?,
            Value::Object(_) => vec![serde_json::from_value(value)?],
            _ => {
                return Err(ConnectorError::Webhook(
                    "expected a JSON object or array".into(),
                ))
            }
        };
        Ok(records
            .into_iter()
            .map(|record| record.into_event(source_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn test_handle_single_and_batch() {
        let source = WebhookSource::new();

        let single = source
            .handle("hooks", br#"{"type":"follow","payload":{"who":"a"}}"#)
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].source, "hooks");
        assert_eq!(single[0].event_type, EventType::Follow);

        let batch = source
            .handle(
                "hooks",
                br#"[{"type":"post","payload":{}},{"type":"reply","payload":{}}]"#,
            )
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_handle_rejects_garbage() {
        let source = WebhookSource::new();
        assert!(source.handle("hooks", b"42").is_err());
        assert!(source.handle("hooks", b"{not json").is_err());
        assert!(source.handle("hooks", br#"{"type":"nope"}"#).is_err());
    }

    #[tokio::test]
    async fn test_custom_signature_header() {
        let mut source = WebhookSource::new();
        source
            .init(&json!({"signature_header": "X-Hub-Signature-256"}))
            .await
            .unwrap();
        assert_eq!(source.signature_header(), "x-hub-signature-256");
        assert!(source.poll(None).await.unwrap().events.is_empty());
    }
}

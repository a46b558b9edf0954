//! Webhook Actor - HTTP POST to external URLs.
//!
//! The [`WebhookActor`] sends events to external HTTP endpoints, enabling
//! integration with chat platforms, automation services or custom receivers.
//!
//! Retries are not handled here: the actor reports one attempt and the
//! delivery subsystem decides whether to try again.
//!
//! # Status mapping
//!
//! ```text
//! 2xx                 → delivered
//! 408, 429, 5xx       → error (retryable)
//! other 4xx, 3xx      → rejected (permanent)
//! transport failure   → error (retryable)
//! ```
//!
//! # Example
//!
//! ```toml
//! [modules.actors.notify]
//! type = "webhook"
//! config = { url = "https://hooks.example.com/in", timeout_ms = 5000 }
//! ```

use super::{Actor, ConnectorError, DeliveryRequest, DeliveryResult};
use crate::event::Event;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for webhook requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An actor that POSTs events to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookActor {
    /// Target URL; a route may override it with `config.url`
    url: Option<String>,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,
}

impl WebhookActor {
    pub fn new() -> Self {
        Self {
            url: None,
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the JSON body for one delivery
    fn build_payload(&self, event: &Event, request: &DeliveryRequest) -> Value {
        json!({
            "event": event,
            "route": request.route,
            "config": request.config,
            "context": request.context,
        })
    }

    fn resolve_url<'a>(&'a self, request: &'a DeliveryRequest) -> Option<&'a str> {
        request
            .config
            .get("url")
            .and_then(Value::as_str)
            .or(self.url.as_deref())
    }
}

impl Default for WebhookActor {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an HTTP status to a delivery outcome.
fn classify_status(status: StatusCode) -> DeliveryResult {
    if status.is_success() {
        DeliveryResult::delivered()
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        DeliveryResult::error(format!("webhook returned status {}", status))
    } else {
        DeliveryResult::rejected(format!("webhook returned status {}", status))
    }
}

#[async_trait]
impl Actor for WebhookActor {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn init(&mut self, config: &Value) -> Result<(), ConnectorError> {
        if let Some(url) = config.get("url").and_then(Value::as_str) {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConnectorError::Init(format!(
                    "webhook URL must start with http:// or https://, got '{}'",
                    url
                )));
            }
            self.url = Some(url.to_string());
        }
        if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
            self.timeout = Duration::from_millis(ms);
        }
        self.client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConnectorError::Init(e.to_string()))?;
        Ok(())
    }

    async fn deliver(&self, event: &Event, request: &DeliveryRequest) -> DeliveryResult {
        let Some(url) = self.resolve_url(request) else {
            return DeliveryResult::rejected("no webhook URL configured");
        };

        debug!(
            url = %url,
            route = %request.route,
            event_id = %event.id,
            "Sending webhook"
        );

        let result = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("X-Trace-Id", event.trace_id.as_str())
            .json(&self.build_payload(event, request))
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let outcome = classify_status(status);
                if status.is_success() {
                    info!(
                        url = %url,
                        status = %status,
                        event_id = %event.id,
                        "Webhook delivered successfully"
                    );
                } else {
                    warn!(
                        url = %url,
                        status = %status,
                        event_id = %event.id,
                        outcome = %outcome.status,
                        "Webhook delivery failed"
                    );
                }
                outcome
            }
            Err(e) => {
                warn!(error = %e, url = %url, "Webhook request failed");
                DeliveryResult::error(format!("HTTP error: {}", e))
            }
        }
    }
}

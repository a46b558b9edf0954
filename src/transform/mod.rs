//! Transforms - per-route steps between matching and delivery.
//!
//! A transform takes an immutable [`Event`] and returns one of:
//!
//! - `Ok(Some(event))`: pass, the (possibly new) event continues
//! - `Ok(None)`: drop, the pipeline halts and nothing is delivered
//! - `Err(_)`: the step failed; the effective [`ErrorPolicy`] decides
//!
//! Transforms never mutate their input. Use [`Event::with_payload`] to
//! derive a modified copy that keeps the event's id and trace id.

pub mod builtin;
pub mod pipeline;

use crate::event::{Event, EventType};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use builtin::{DedupTransform, EnrichTransform, FilterTransform};
pub use pipeline::{BoundTransform, PipelineOutcome, TransformPipeline};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform failed: {0}")]
    Failed(String),

    #[error("transform timed out after {0}ms")]
    Timeout(u64),

    #[error("transform init failed: {0}")]
    Init(String),
}

/// What happens when a step errors or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Continue with the pre-step event (fail-open)
    #[default]
    Pass,
    /// Discard the event
    Drop,
    /// Stop the pipeline, distinct from a content drop
    Halt,
}

/// A transform reference in a route: either a bare id or an id with an
/// error-policy override.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TransformRef {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        on_error: Option<ErrorPolicy>,
    },
}

impl TransformRef {
    pub fn name(&self) -> &str {
        match self {
            TransformRef::Name(name) => name,
            TransformRef::Spec { name, .. } => name,
        }
    }

    pub fn on_error(&self) -> Option<ErrorPolicy> {
        match self {
            TransformRef::Name(_) => None,
            TransformRef::Spec { on_error, .. } => *on_error,
        }
    }
}

/// Where in the pipeline a transform is running.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformContext {
    pub module: String,
    pub source: String,
    pub target: String,
    pub event_type: EventType,
    pub route_name: String,
}

#[async_trait]
pub trait Transform: Send + Sync {
    /// Transform type name (e.g. "dedup")
    fn name(&self) -> &str;

    async fn init(&mut self, _config: &Value) -> Result<(), TransformError> {
        Ok(())
    }

    async fn execute(
        &self,
        event: &Event,
        context: &TransformContext,
    ) -> Result<Option<Event>, TransformError>;

    async fn shutdown(&self) -> Result<(), TransformError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transform_ref_forms() {
        let refs: Vec<TransformRef> = serde_json::from_value(json!([
            "dedup",
            {"name": "enrich", "on_error": "halt"},
            {"name": "filter"}
        ]))
        .unwrap();

        assert_eq!(refs[0].name(), "dedup");
        assert_eq!(refs[0].on_error(), None);
        assert_eq!(refs[1].name(), "enrich");
        assert_eq!(refs[1].on_error(), Some(ErrorPolicy::Halt));
        assert_eq!(refs[2].on_error(), None);
    }

    #[test]
    fn test_default_policy_is_fail_open() {
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Pass);
    }
}

//! Dead Letter Queue for failed deliveries.
//!
//! Deliveries that end in exhausted retries, an open circuit or backpressure
//! are appended here, one JSON line per event, for manual investigation and
//! potential redelivery.
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::open("data/dlq/github.jsonl").await?;
//! dlq.add_failed_event(&event, "notify", "webhook", "HTTP error: timeout", 3).await?;
//!
//! // Later, list failed events
//! let failed = dlq.list(10, 0).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::event::Event;

/// A failed event stored in the Dead Letter Queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    /// When the event was moved to the DLQ
    pub failed_at: DateTime<Utc>,

    pub route: String,

    pub actor: String,

    /// Error message from the last failed attempt
    pub error: String,

    /// Delivery attempts made before giving up
    pub attempts: u32,

    /// Original event data
    pub event: Event,
}

/// File-backed dead letter queue for one module.
pub struct DeadLetterQueue {
    path: PathBuf,
    file: Mutex<File>,
    events_total: AtomicU64,
}

impl DeadLetterQueue {
    /// Open (or create) a DLQ file at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DlqError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            events_total: AtomicU64::new(0),
        })
    }

    /// Add a failed event to the DLQ.
    pub async fn add_failed_event(
        &self,
        event: &Event,
        route: &str,
        actor: &str,
        error: &str,
        attempts: u32,
    ) -> Result<(), DlqError> {
        let entry = FailedEvent {
            failed_at: Utc::now(),
            route: route.to_string(),
            actor: actor.to_string(),
            error: error.to_string(),
            attempts,
            event: event.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        {
            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
        }
        self.events_total.fetch_add(1, Ordering::Relaxed);

        info!(
            route = %route,
            actor = %actor,
            event_id = %event.id,
            attempts,
            "Event moved to Dead Letter Queue"
        );
        Ok(())
    }

    /// Events written through this handle since it was opened.
    pub fn count(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    /// List entries in the DLQ file, oldest first.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<FailedEvent>, DlqError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let result: Vec<FailedEvent> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping unreadable DLQ line");
                    None
                }
            })
            .skip(offset)
            .take(count)
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors that can occur when working with the Dead Letter Queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

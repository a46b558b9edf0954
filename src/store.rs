//! Event Store - optional audit record of processed events.
//!
//! After each route-match leaves the pipeline, one [`StoredEvent`] is
//! appended with the route name and how the match ended. Records are
//! returned in append order, so the store can be read back to replay
//! traffic into another module or a test.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::event::Event;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How one route-match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    Delivered,
    Dropped,
    Halted,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub recorded_at: DateTime<Utc>,
    pub route: String,
    pub outcome: RouteOutcome,
    pub event: Event,
}

impl StoredEvent {
    pub fn new(route: impl Into<String>, outcome: RouteOutcome, event: Event) -> Self {
        Self {
            recorded_at: Utc::now(),
            route: route.into(),
            outcome,
            event,
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record(&self, record: &StoredEvent) -> Result<(), StoreError>;

    /// Every record, in append order.
    async fn read_all(&self) -> Result<Vec<StoredEvent>, StoreError>;

    /// Events recorded with the given outcome, in append order.
    async fn replay(&self, outcome: RouteOutcome) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.event)
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    records: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record(&self, record: &StoredEvent) -> Result<(), StoreError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self.records.lock().clone())
    }
}

/// Append-only JSON-lines store.
pub struct FileEventStore {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl FileEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
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
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn record(&self, record: &StoredEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<StoredEvent>, StoreError> {
        // Hold the writer lock so no half-written line is read
        let _file = self.file.lock().await;
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping unreadable event record");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn event(n: u64) -> Event {
        Event::new("s", EventType::Post, json!({"n": n})).with_module("m")
    }

    #[tokio::test]
    async fn test_memory_store_replay() {
        let store = MemoryEventStore::new();
        store
            .record(&StoredEvent::new("r", RouteOutcome::Delivered, event(1)))
            .await
            .unwrap();
        store
            .record(&StoredEvent::new("r", RouteOutcome::Dropped, event(2)))
            .await
            .unwrap();
        store
            .record(&StoredEvent::new("r", RouteOutcome::Delivered, event(3)))
            .await
            .unwrap();

        assert_eq!(store.read_all().await.unwrap().len(), 3);
        let delivered = store.replay(RouteOutcome::Delivered).await.unwrap();
        let ns: Vec<u64> = delivered.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_file_store_persists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events").join("m.jsonl");

        {
            let store = FileEventStore::open(&path).await.unwrap();
            for n in 0..4 {
                store
                    .record(&StoredEvent::new("r", RouteOutcome::Delivered, event(n)))
                    .await
                    .unwrap();
            }
        }

        let store = FileEventStore::open(&path).await.unwrap();
        let records = store.read_all().await.unwrap();
        let ns: Vec<u64> = records
            .iter()
            .map(|r| r.event.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3]);

        let line = std::fs::read_to_string(&path).unwrap();
        let first: serde_json::Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert!(first["recordedAt"].is_string());
        assert_eq!(first["outcome"], "delivered");
    }
}

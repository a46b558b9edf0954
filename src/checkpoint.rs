//! Checkpoint Store - one opaque resume marker per source.
//!
//! A checkpoint means "everything up to here has been handed to the bus".
//! The scheduler only calls [`CheckpointStore::set`] after the bus accepted a
//! poll's events, so a crash between the two replays events rather than
//! losing them.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Per-module checkpoint storage keyed by source id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, source: &str) -> Result<Option<String>, CheckpointError>;

    async fn set(&self, source: &str, checkpoint: &str) -> Result<(), CheckpointError>;
}

/// Checkpoints held in process memory only.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, source: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.entries.read().get(source).cloned())
    }

    async fn set(&self, source: &str, checkpoint: &str) -> Result<(), CheckpointError> {
        self.entries
            .write()
            .insert(source.to_string(), checkpoint.to_string());
        Ok(())
    }
}

/// Checkpoints persisted as one JSON object per module.
///
/// Writes are atomic via temp file + rename.
pub struct FileCheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCheckpointStore {
    /// Open (or create) the checkpoint file, loading existing entries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), sources = entries.len(), "Checkpoints loaded");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, source: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.entries.lock().await.get(source).cloned())
    }

    async fn set(&self, source: &str, checkpoint: &str) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(source.to_string(), checkpoint.to_string());

        let bytes = serde_json::to_vec_pretty(&*entries)?;
        let tmp_path = self.path.with_extension("tmp");
        let written = async {
            tokio::fs::write(&tmp_path, &bytes).await?;
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(e) = written {
            // Keep memory consistent with what is on disk
            match previous {
                Some(previous) => entries.insert(source.to_string(), previous),
                None => entries.remove(source),
            };
            return Err(e.into());
        }
        Ok(())
    }
}

//! Webhook buffer - events pushed over HTTP waiting for the next poll tick.
//!
//! With persistence on, the buffer is mirrored to a JSON-lines file holding
//! exactly the events the bus has not yet accepted. The scheduler
//! [`drain`](WebhookBuffer::drain)s, publishes, then
//! [`commit`](WebhookBuffer::commit)s; a crash in between replays the
//! drained events on the next load rather than losing them.

use crate::event::Event;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("webhook buffer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("webhook buffer serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct WebhookBuffer {
    events: Mutex<Vec<Event>>,
    path: Option<PathBuf>,
    file_lock: tokio::sync::Mutex<()>,
}

impl WebhookBuffer {
    pub fn in_memory() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            path: None,
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a persisted buffer, restoring events left by a previous run.
    pub async fn persistent(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let restored = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| match serde_json::from_str::<Event>(line) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable buffered event");
                        None
                    }
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !restored.is_empty() {
            debug!(path = %path.display(), restored = restored.len(), "Webhook buffer restored");
        }

        Ok(Self {
            events: Mutex::new(restored),
            path: Some(path),
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Buffer events; persisted (if enabled) before they become drainable.
    pub async fn push(&self, events: Vec<Event>) -> Result<usize, BufferError> {
        let count = events.len();
        if count == 0 {
            return Ok(0);
        }

        let _guard = self.file_lock.lock().await;
        if let Some(path) = &self.path {
            let mut buf = Vec::new();
            for event in &events {
                serde_json::to_writer(&mut buf, event)?;
                buf.push(b'\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(&buf).await?;
            file.flush().await?;
        }
        self.events.lock().extend(events);
        Ok(count)
    }

    /// Take everything buffered so far.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Put drained events back at the front after the bus refused them.
    /// The persisted file still holds them, since no commit happened.
    pub fn requeue(&self, mut events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut buffered = self.events.lock();
        events.append(&mut buffered);
        *buffered = events;
    }

    /// Rewrite the persisted file to hold only events still buffered.
    /// Call after the drained events were accepted by the bus.
    pub async fn commit(&self) -> Result<(), BufferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.file_lock.lock().await;
        let remaining = self.events.lock().clone();

        let mut buf = Vec::new();
        for event in &remaining {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &buf).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

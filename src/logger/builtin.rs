//! Built-in loggers: `tracing`, `jsonl` and `memory`.

use super::{LogEntry, Logger, LoggerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Forwards entries to the process `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    prefix: Option<String>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Logger for TracingLogger {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn init(&mut self, config: &Value) -> Result<(), LoggerError> {
        self.prefix = config
            .get("prefix")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }

    async fn log(&self, entry: &LogEntry) -> Result<(), LoggerError> {
        let prefix = self.prefix.as_deref().unwrap_or("pipeline");
        let event_id = entry.event_id.map(|id| id.to_string()).unwrap_or_default();
        let trace_id = entry.trace_id.as_deref().unwrap_or("");

        if entry.phase.is_error() {
            warn!(
                module = %entry.module,
                event_id = %event_id,
                trace_id = %trace_id,
                source = ?entry.source,
                route = ?entry.route,
                transform = ?entry.transform,
                target = ?entry.target,
                error = ?entry.error,
                queue_depth = ?entry.queue_depth,
                "[{}] {}",
                prefix,
                entry.phase.as_str()
            );
        } else {
            info!(
                module = %entry.module,
                event_id = %event_id,
                trace_id = %trace_id,
                source = ?entry.source,
                route = ?entry.route,
                transform = ?entry.transform,
                target = ?entry.target,
                duration_ms = ?entry.duration_ms,
                "[{}] {}",
                prefix,
                entry.phase.as_str()
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlLogger {
    path: Option<PathBuf>,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonlLogger {
    pub fn new() -> Self {
        Self {
            path: None,
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: tokio::sync::Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<(), LoggerError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| LoggerError::Init("jsonl logger requires 'path'".into()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }
}

impl Default for JsonlLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Logger for JsonlLogger {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn init(&mut self, config: &Value) -> Result<(), LoggerError> {
        if let Some(path) = config.get("path").and_then(Value::as_str) {
            self.path = Some(PathBuf::from(path));
        }
        self.open().await
    }

    async fn log(&self, entry: &LogEntry) -> Result<(), LoggerError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => {
                file.write_all(&line).await?;
                Ok(())
            }
            None => Err(LoggerError::Init("jsonl logger not initialized".into())),
        }
    }

    async fn shutdown(&self) -> Result<(), LoggerError> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Keeps the most recent entries in memory. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct MemoryLogger {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl MemoryLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for MemoryLogger {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Logger for MemoryLogger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn init(&mut self, config: &Value) -> Result<(), LoggerError> {
        if let Some(capacity) = config.get("capacity").and_then(Value::as_u64) {
            self.capacity = (capacity as usize).max(1);
        }
        Ok(())
    }

    async fn log(&self, entry: &LogEntry) -> Result<(), LoggerError> {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Phase;
    use serde_json::json;

    #[tokio::test]
    async fn test_jsonl_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("pipeline.jsonl");

        let mut logger = JsonlLogger::new();
        logger
            .init(&json!({"path": path.to_str().unwrap()}))
            .await
            .unwrap();

        logger.log(&LogEntry::new(Phase::SourcePoll, "m")).await.unwrap();
        logger
            .log(&LogEntry::new(Phase::BusAcked, "m").with_error("x"))
            .await
            .unwrap();
        logger.shutdown().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: LogEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.phase, Phase::BusAcked);
        assert_eq!(second.error.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_jsonl_logger_requires_path() {
        let mut logger = JsonlLogger::new();
        assert!(logger.init(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_logger_is_bounded() {
        let logger = MemoryLogger::new(2);
        for phase in [Phase::SourcePoll, Phase::BusEnqueued, Phase::BusAcked] {
            logger.log(&LogEntry::new(phase, "m")).await.unwrap();
        }

        let phases: Vec<Phase> = logger.entries().iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::BusEnqueued, Phase::BusAcked]);
    }
}

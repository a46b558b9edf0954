//! File Source - tails a JSON-lines file.
//!
//! Each line is an [`ActivityRecord`]. The checkpoint is the byte offset just
//! past the last complete line handed out, so the source is
//! checkpoint-monotonic: polling again with the same checkpoint never yields
//! lines that were already returned under an earlier one.
//!
//! ```toml
//! [modules.sources.feed]
//! type = "file"
//! interval_ms = 5000
//! config = { path = "data/feed.jsonl" }
//! ```

use super::{ActivityRecord, ConnectorError, PollBatch, Source};
use async_trait::async_trait;
use serde_json::Value;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Maximum bytes read per poll
const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FileSource {
    path: Option<PathBuf>,
    max_bytes: u64,
}

impl FileSource {
    pub fn new() -> Self {
        Self {
            path: None,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn init(&mut self, config: &Value) -> Result<(), ConnectorError> {
        if let Some(path) = config.get("path").and_then(Value::as_str) {
            self.path = Some(PathBuf::from(path));
        }
        if let Some(max) = config.get("max_bytes").and_then(Value::as_u64) {
            self.max_bytes = max.max(1);
        }
        if self.path.is_none() {
            return Err(ConnectorError::Init("file source requires 'path'".into()));
        }
        Ok(())
    }

    async fn poll(&self, checkpoint: Option<&str>) -> Result<PollBatch, ConnectorError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ConnectorError::Poll("file source not initialized".into()))?;

        let mut offset: u64 = match checkpoint {
            Some(cp) => cp
                .parse()
                .map_err(|_| ConnectorError::Poll(format!("invalid checkpoint '{}'", cp)))?,
            None => 0,
        };

        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Feed file not present yet");
                return Ok(PollBatch::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if offset > len {
            warn!(
                path = %path.display(),
                offset,
                len,
                "Feed file shrank, restarting from the beginning"
            );
            offset = 0;
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take(self.max_bytes).read_to_end(&mut buf).await?;

        // Only consume complete lines
        let consumed = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(PollBatch::new(Vec::new(), Some(offset.to_string()))),
        };

        let mut events = Vec::new();
        for line in buf[..consumed].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ActivityRecord>(line) {
                Ok(record) => events.push(record.into_event(self.name())),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed feed line");
                }
            }
        }

        let next = offset + consumed as u64;
        Ok(PollBatch::new(events, Some(next.to_string())))
    }
}

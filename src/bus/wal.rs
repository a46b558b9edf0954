//! Durable bus backed by a write-ahead log.
//!
//! The log is a JSON-lines file of two record kinds:
//!
//! ```text
//! {"op":"append","seq":7,"event":{...}}
//! {"op":"ack","seq":7}
//! ```
//!
//! `publish` returns only after the append record is written (and synced
//! when `fsync` is on). On open every append without a matching ack is
//! replayed in sequence order; acknowledged entries never come back. A torn
//! trailing line from a crash mid-write is skipped.
//!
//! The log is compacted on open and on close: rewritten to a temp file
//! holding only the unacknowledged appends, then renamed into place.

use super::{BusEntry, BusError, BusKind, EventBus};
use crate::event::Event;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WalRecord {
    Append { seq: u64, event: Event },
    Ack { seq: u64 },
}

struct WalWriter {
    file: Option<File>,
    next_seq: u64,
}

pub struct WalBus {
    path: PathBuf,
    fsync: bool,
    writer: AsyncMutex<WalWriter>,
    pending: Mutex<BTreeMap<u64, Event>>,
    tx: Mutex<Option<mpsc::UnboundedSender<BusEntry>>>,
    replayed: usize,
}

impl WalBus {
    /// Open the log at `path`, compact it and queue unacknowledged entries
    /// for replay ahead of anything published later.
    pub async fn open(
        path: impl AsRef<Path>,
        fsync: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BusEntry>), BusError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (unacked, max_seq) = read_log(&path).await?;
        write_compacted(&path, &unacked, fsync).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        for (seq, event) in &unacked {
            // Receiver is alive; it is returned below
            let _ = tx.send(BusEntry {
                seq: *seq,
                event: event.clone(),
                replayed: true,
            });
        }

        let replayed = unacked.len();
        if replayed > 0 {
            info!(path = %path.display(), replayed, "Replaying unacknowledged WAL entries");
        }

        let bus = Self {
            path,
            fsync,
            writer: AsyncMutex::new(WalWriter {
                file: Some(file),
                next_seq: max_seq + 1,
            }),
            pending: Mutex::new(unacked),
            tx: Mutex::new(Some(tx)),
            replayed,
        };
        Ok((bus, rx))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries queued for replay when the log was opened.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    async fn append_record(&self, file: &mut File, record: &WalRecord) -> Result<(), BusError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_data().await?;
        }
        Ok(())
    }
}

/// Parse the log into unacknowledged appends (in seq order) and the
/// highest sequence number seen.
async fn read_log(path: &Path) -> Result<(BTreeMap<u64, Event>, u64), BusError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((BTreeMap::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut unacked = BTreeMap::new();
    let mut max_seq = 0;
    let lines: Vec<&[u8]> = contents
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .collect();
    let last = lines.len().saturating_sub(1);

    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_slice::<WalRecord>(line) {
            Ok(WalRecord::Append { seq, event }) => {
                max_seq = max_seq.max(seq);
                unacked.insert(seq, event);
            }
            Ok(WalRecord::Ack { seq }) => {
                max_seq = max_seq.max(seq);
                unacked.remove(&seq);
            }
            Err(e) if index == last => {
                warn!(path = %path.display(), error = %e, "Skipping torn trailing WAL record");
            }
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "Skipping corrupt WAL record");
            }
        }
    }
    Ok((unacked, max_seq))
}

async fn write_compacted(path: &Path, unacked: &BTreeMap<u64, Event>, fsync: bool) -> Result<(), BusError> {
    let mut buf = Vec::new();
    for (seq, event) in unacked {
        serde_json::to_writer(
            &mut buf,
            &WalRecord::Append {
                seq: *seq,
                event: event.clone(),
            },
        )?;
        buf.push(b'\n');
    }

    let tmp_path = path.with_extension("wal.tmp");
    let mut tmp = File::create(&tmp_path).await?;
    tmp.write_all(&buf).await?;
    tmp.flush().await?;
    if fsync {
        tmp.sync_all().await?;
    }
    drop(tmp);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl EventBus for WalBus {
    fn kind(&self) -> BusKind {
        BusKind::Durable
    }

    async fn publish(&self, event: Event) -> Result<u64, BusError> {
        let mut writer = self.writer.lock().await;
        let seq = writer.next_seq;
        let file = writer.file.as_mut().ok_or(BusError::Closed)?;

        let record = WalRecord::Append {
            seq,
            event: event.clone(),
        };
        self.append_record(file, &record).await?;
        writer.next_seq += 1;

        self.pending.lock().insert(seq, event.clone());
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(BusEntry {
                    seq,
                    event,
                    replayed: false,
                })
                .is_ok(),
            None => false,
        };
        if !sent {
            // Logged but undeliverable now; replayed on the next open
            return Err(BusError::Closed);
        }
        Ok(seq)
    }

    async fn ack(&self, seq: u64) -> Result<(), BusError> {
        let mut writer = self.writer.lock().await;
        if !self.pending.lock().contains_key(&seq) {
            return Ok(());
        }
        let Some(file) = writer.file.as_mut() else {
            return Err(BusError::Closed);
        };
        self.append_record(file, &WalRecord::Ack { seq }).await?;
        self.pending.lock().remove(&seq);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    async fn close(&self) -> Result<(), BusError> {
        self.tx.lock().take();

        let mut writer = self.writer.lock().await;
        let Some(mut file) = writer.file.take() else {
            return Ok(());
        };
        file.flush().await?;
        drop(file);

        let unacked = self.pending.lock().clone();
        write_compacted(&self.path, &unacked, self.fsync).await?;
        info!(
            path = %self.path.display(),
            pending = unacked.len(),
            "WAL compacted on close"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;
    use std::io::Write;

    fn event(n: u64) -> Event {
        Event::new("s", EventType::Post, json!({"n": n})).with_module("m")
    }

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_replays_unacked_in_order_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");

        {
            let (bus, mut rx) = WalBus::open(&path, false).await.unwrap();
            for n in 1..=5 {
                bus.publish(event(n)).await.unwrap();
            }
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            bus.ack(first.seq).await.unwrap();
            bus.ack(second.seq).await.unwrap();
            // Dropped without close: a crash
        }

        let (bus, mut rx) = WalBus::open(&path, false).await.unwrap();
        assert_eq!(bus.replayed(), 3);
        assert_eq!(bus.pending(), 3);

        let mut replayed = Vec::new();
        for _ in 0..3 {
            let entry = rx.recv().await.unwrap();
            assert!(entry.replayed);
            replayed.push(entry.event.payload["n"].as_u64().unwrap());
        }
        assert_eq!(replayed, vec![3, 4, 5]);
        assert!(rx.try_recv().is_err());

        // Sequence numbers continue after the highest seen
        let seq = bus.publish(event(6)).await.unwrap();
        assert_eq!(seq, 6);
    }

    #[tokio::test]
    async fn test_all_unacked_replayed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");
        let mut ids = Vec::new();

        {
            let (bus, _rx) = WalBus::open(&path, true).await.unwrap();
            for n in 0..10 {
                let e = event(n);
                ids.push(e.id);
                bus.publish(e).await.unwrap();
            }
        }

        let (_bus, mut rx) = WalBus::open(&path, false).await.unwrap();
        let mut seen = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            seen.push(entry.event.id);
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_open_compacts_acked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");

        {
            let (bus, _rx) = WalBus::open(&path, false).await.unwrap();
            let a = bus.publish(event(1)).await.unwrap();
            bus.publish(event(2)).await.unwrap();
            bus.ack(a).await.unwrap();
        }
        assert_eq!(lines(&path).len(), 3);

        let _reopened = WalBus::open(&path, false).await.unwrap();
        let records = lines(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["op"], "append");
        assert_eq!(records[0]["seq"], 2);
    }

    #[tokio::test]
    async fn test_close_compacts_and_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");

        let (bus, mut rx) = WalBus::open(&path, false).await.unwrap();
        let a = bus.publish(event(1)).await.unwrap();
        bus.ack(a).await.unwrap();
        bus.close().await.unwrap();

        assert!(lines(&path).is_empty());
        assert!(matches!(bus.publish(event(2)).await, Err(BusError::Closed)));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");

        {
            let (bus, _rx) = WalBus::open(&path, false).await.unwrap();
            bus.publish(event(1)).await.unwrap();
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"append\",\"seq\":2,\"ev").unwrap();
        drop(file);

        let (bus, mut rx) = WalBus::open(&path, false).await.unwrap();
        assert_eq!(bus.replayed(), 1);
        assert_eq!(rx.recv().await.unwrap().event.payload["n"], 1);
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.wal");

        let (bus, _rx) = WalBus::open(&path, false).await.unwrap();
        let seq = bus.publish(event(1)).await.unwrap();
        bus.ack(seq).await.unwrap();
        bus.ack(seq).await.unwrap();
        bus.ack(999).await.unwrap();
        assert_eq!(lines(&path).len(), 2);
    }
}

//! In-memory bus. Nothing survives a restart.

use super::{BusEntry, BusError, BusKind, EventBus};
use crate::event::Event;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub struct MemoryBus {
    next_seq: AtomicU64,
    pending: Mutex<BTreeSet<u64>>,
    tx: Mutex<Option<mpsc::UnboundedSender<BusEntry>>>,
}

impl MemoryBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(BTreeSet::new()),
            tx: Mutex::new(Some(tx)),
        };
        (bus, rx)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    fn kind(&self) -> BusKind {
        BusKind::Memory
    }

    async fn publish(&self, event: Event) -> Result<u64, BusError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(BusError::Closed)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(seq);
        if tx
            .send(BusEntry {
                seq,
                event,
                replayed: false,
            })
            .is_err()
        {
            self.pending.lock().remove(&seq);
            return Err(BusError::Closed);
        }
        Ok(seq)
    }

    async fn ack(&self, seq: u64) -> Result<(), BusError> {
        self.pending.lock().remove(&seq);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    async fn close(&self) -> Result<(), BusError> {
        self.tx.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_deliver_ack() {
        let (bus, mut rx) = MemoryBus::new();
        let event = Event::new("s", EventType::Post, json!({})).with_module("m");

        let seq = bus.publish(event.clone()).await.unwrap();
        assert_eq!(bus.pending(), 1);

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.seq, seq);
        assert_eq!(entry.event, event);
        assert!(!entry.replayed);

        bus.ack(seq).await.unwrap();
        bus.ack(seq).await.unwrap();
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_bus_refuses_events() {
        let (bus, mut rx) = MemoryBus::new();
        bus.close().await.unwrap();

        let event = Event::new("s", EventType::Post, json!({})).with_module("m");
        assert!(matches!(bus.publish(event).await, Err(BusError::Closed)));
        assert!(rx.recv().await.is_none());
    }
}

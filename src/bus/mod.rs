//! Event Bus - carries events from sources to the routing stage.
//!
//! One bus per module. Producers call [`EventBus::publish`]; the routing
//! stage consumes [`BusEntry`] values from the receiver handed out at
//! construction and calls [`EventBus::ack`] once every route-match for the
//! entry has exited the pipeline.
//!
//! | Implementation | Survives restart | Notes |
//! |----------------|------------------|-------|
//! | [`MemoryBus`]  | no               | pending set only |
//! | [`WalBus`]     | yes              | append-only JSON lines, replay on open |

pub mod memory;
pub mod wal;

use crate::event::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBus;
pub use wal::WalBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus is closed")]
    Closed,
}

/// Which bus implementation a runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Memory,
    Durable,
}

/// An event accepted by the bus, tagged with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEntry {
    pub seq: u64,
    pub event: Event,
    /// Set for entries restored from the log at startup
    pub replayed: bool,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    fn kind(&self) -> BusKind;

    /// Accept an event. Once this returns the event is owned by the bus.
    async fn publish(&self, event: Event) -> Result<u64, BusError>;

    /// Mark an entry as having fully exited the pipeline. Idempotent.
    async fn ack(&self, seq: u64) -> Result<(), BusError>;

    /// Entries published (or replayed) but not yet acknowledged.
    fn pending(&self) -> usize;

    /// Stop accepting events and close the consumer channel.
    async fn close(&self) -> Result<(), BusError>;
}

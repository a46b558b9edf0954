//! # Tributary
//!
//! An event-routing runtime: sources are polled (or pushed to over signed
//! webhooks), their events pass through a per-module bus, are matched
//! against declarative routes, run through transform chains and are
//! delivered to actors with retry, backoff and circuit breaking.
//!
//! ## Architecture
//!
//! ```text
//! Source -> Scheduler -> Event Bus (memory | WAL) -> Route Matcher
//!        -> Transform Pipeline -> Delivery -> Actor
//!                 every phase -> Logger Manager
//! ```
//!
//! ## Modules
//!
//! - [`runtime`]: owns loaded modules; load, unload, reload
//! - [`module`]: one module's live wiring and lifecycle
//! - [`scheduler`]: per-source poll loops with circuit breaking
//! - [`bus`]: in-memory and write-ahead-logged event buses
//! - [`router`]: route definitions and matching
//! - [`transform`]: transform trait, built-ins and the pipeline executor
//! - [`delivery`]: retry, backoff, rate limiting and backpressure
//! - [`logger`]: pipeline log entries and the logger manager
//! - [`connectors`]: source and actor traits plus built-ins
//! - [`server`]: health, status and webhook ingestion over HTTP

pub mod buffer;
pub mod bus;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod connectors;
pub mod delivery;
pub mod dlq;
pub mod event;
pub mod logger;
pub mod module;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod transform;

// Re-export commonly used types at crate root
pub use config::{ConfigError, ModuleDefinition, TributaryConfig};
pub use event::{Event, EventType};
pub use module::{ModuleInstance, ModuleState};
pub use registry::ConnectorRegistry;
pub use runtime::{Runtime, RuntimeError};

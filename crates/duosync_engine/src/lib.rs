//! # DuoSync Engine
//!
//! Pairing, encrypted peer connection and reconciliation for DuoSync.
//!
//! This crate provides:
//! - Pairing of two devices through an out-of-band payload
//! - `ConnectionManager`: one encrypted channel with reconnect backoff
//! - `SyncEngine`: full sync, incremental updates and conflict handling
//! - `SyncSession`: wiring of transport, connection and engine for a paired device
//! - An in-memory loopback transport and store for tests and demos
//!
//! ## Architecture
//!
//! ```text
//! LocalStore ◀──▶ SyncEngine ◀── events ── ConnectionManager ◀──▶ Transport
//!                    │ (single task)              ▲
//!                    └──────── send ──────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! - Every frame on the wire is encrypted with the pair's shared key
//! - At most one reconnect timer is pending, and only the dialer reconnects
//! - Changes are never dropped while offline; they are queued and flushed
//! - Incremental application is idempotent
//! - Store writes replace whole collections

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connection;
mod driver;
mod engine;
mod error;
mod loopback;
mod pairing;
mod session;
mod store;
mod sync_config;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ReconnectPolicy};
pub use connection::{
    peer_address, ConnectionEvent, ConnectionListener, ConnectionManager, ConnectionStatus, Role,
};
pub use driver::{spawn_engine, EngineCommand, EngineHandle};
pub use engine::{
    ConflictResolver, EngineMonitor, MessageSink, PolicyResolver, SyncEngine, SyncState, SyncStats,
};
pub use error::{
    ConnectionError, ConnectionResult, PairingError, PairingResult, SyncError, SyncResult,
};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use pairing::{Pairing, PairingOffer, PairingPayload};
pub use session::{SyncSession, SyncSessionBuilder};
pub use store::{snapshot, write_changes, LocalStore, MemoryStore};
pub use sync_config::{ConfigStore, FileConfigStore, MemoryConfigStore, SyncConfig, CONFIG_KEY};
pub use transport::{Channel, ChannelEvent, Transport, TransportError};

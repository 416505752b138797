//! # DuoSync Protocol
//!
//! Data model, reconciliation rules and wire messages for DuoSync.
//!
//! This crate provides:
//! - `Todo`, `Session` and `Settings`, the three synced collections
//! - `SyncPayload` full snapshots and `SyncChange` incremental mutations
//! - `merge_payloads` for full reconciliation with conflict detection
//! - `apply_changes` for idempotent incremental application
//! - `SyncMessage`, the JSON messages exchanged between peers
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod merge;
mod messages;
mod model;
mod payload;

pub use change::{apply_changes, AppliedChanges, ChangeAction, SyncChange};
pub use conflict::{apply_resolution, ConflictPolicy, ResolvedConflict, Resolution, SyncConflict};
pub use error::{ProtocolError, ProtocolResult};
pub use merge::{
    merge_payloads, merge_sessions, merge_settings, merge_todos, merge_tombstones,
    prune_tombstones, MergeOutcome, DEFAULT_CONFLICT_WINDOW_MS,
};
pub use messages::{
    Ack, ConflictResolutionMessage, FullSyncRequest, FullSyncResponse, Hello, IncrementalUpdate,
    SyncMessage, PROTOCOL_VERSION,
};
pub use model::{Keyed, Session, Settings, Target, Todo, Tombstone};
pub use payload::SyncPayload;

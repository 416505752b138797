//! Protocol messages exchanged between paired devices.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! ```text
//! hello                 device introduction, sent by both sides on open
//! full-sync-request     requester's snapshot
//! full-sync-response    merged snapshot + conflicts (responder's perspective)
//! incremental-update    batch of changes, acknowledged by `ack`
//! conflict-resolution   decisions (sender's perspective)
//! ack                   acknowledges an incremental-update by timestamp
//! ```

use crate::change::SyncChange;
use crate::conflict::{ResolvedConflict, SyncConflict};
use crate::error::ProtocolResult;
use crate::payload::{lenient, SyncPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// Device introduction.
    Hello(Hello),
    /// Request a full reconciliation.
    FullSyncRequest(FullSyncRequest),
    /// Merged result of a full reconciliation.
    FullSyncResponse(FullSyncResponse),
    /// Incremental changes.
    IncrementalUpdate(IncrementalUpdate),
    /// Conflict decisions.
    ConflictResolution(ConflictResolutionMessage),
    /// Acknowledgement of an incremental update.
    Ack(Ack),
}

/// Device introduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Send time.
    pub timestamp: i64,
    /// Sender's device id.
    pub device_id: String,
    /// Sender's protocol version.
    pub protocol_version: u32,
}

/// Full reconciliation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncRequest {
    /// Send time.
    pub timestamp: i64,
    /// The requester's snapshot. `None` if it was missing or malformed.
    #[serde(default, deserialize_with = "lenient")]
    pub data: Option<SyncPayload>,
}

/// Full reconciliation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncResponse {
    /// Send time.
    pub timestamp: i64,
    /// The merged snapshot. `None` if it was missing or malformed.
    #[serde(default, deserialize_with = "lenient")]
    pub data: Option<SyncPayload>,
    /// Conflicts from the responder's perspective.
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    /// True if the responder will send the resolutions.
    #[serde(default)]
    pub awaiting_resolution: bool,
}

/// Incremental changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalUpdate {
    /// Batch id, unique and increasing per sender.
    pub timestamp: i64,
    /// The changes, in order.
    pub changes: Vec<SyncChange>,
}

/// Conflict decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionMessage {
    /// Decisions from the sender's perspective.
    pub resolutions: Vec<ResolvedConflict>,
}

/// Acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Send time.
    pub timestamp: i64,
    /// Timestamp of the acknowledged incremental update.
    pub for_timestamp: i64,
}

impl SyncMessage {
    /// Creates a hello message.
    pub fn hello(timestamp: i64, device_id: impl Into<String>) -> Self {
        Self::Hello(Hello {
            timestamp,
            device_id: device_id.into(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Creates a full sync request.
    pub fn full_sync_request(timestamp: i64, data: SyncPayload) -> Self {
        Self::FullSyncRequest(FullSyncRequest {
            timestamp,
            data: Some(data),
        })
    }

    /// Creates a full sync response.
    pub fn full_sync_response(
        timestamp: i64,
        data: SyncPayload,
        conflicts: Vec<SyncConflict>,
        awaiting_resolution: bool,
    ) -> Self {
        Self::FullSyncResponse(FullSyncResponse {
            timestamp,
            data: Some(data),
            conflicts,
            awaiting_resolution,
        })
    }

    /// Creates an incremental update.
    pub fn incremental_update(timestamp: i64, changes: Vec<SyncChange>) -> Self {
        Self::IncrementalUpdate(IncrementalUpdate { timestamp, changes })
    }

    /// Creates a conflict resolution message.
    pub fn conflict_resolution(resolutions: Vec<ResolvedConflict>) -> Self {
        Self::ConflictResolution(ConflictResolutionMessage { resolutions })
    }

    /// Creates an ack.
    pub fn ack(timestamp: i64, for_timestamp: i64) -> Self {
        Self::Ack(Ack {
            timestamp,
            for_timestamp,
        })
    }

    /// Returns the wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "hello",
            SyncMessage::FullSyncRequest(_) => "full-sync-request",
            SyncMessage::FullSyncResponse(_) => "full-sync-response",
            SyncMessage::IncrementalUpdate(_) => "incremental-update",
            SyncMessage::ConflictResolution(_) => "conflict-resolution",
            SyncMessage::Ack(_) => "ack",
        }
    }

    /// Encodes to JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from JSON.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Extracts the batch timestamp of an `incremental-update` that failed
    /// to decode, so it can still be acknowledged.
    pub fn undecodable_update_timestamp(json: &str) -> Option<i64> {
        let value: Value = serde_json::from_str(json).ok()?;
        if value.get("type")?.as_str()? != "incremental-update" {
            return None;
        }
        value.get("timestamp")?.as_i64()
    }
}

//! Full snapshots exchanged during reconciliation.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{Keyed, Session, Settings, Todo, Tombstone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A full snapshot of the three synced collections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// All todos.
    pub todos: Vec<Todo>,
    /// All sessions.
    pub sessions: Vec<Session>,
    /// The settings singleton.
    pub settings: Settings,
    /// Deletion markers. Absent on the wire means none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tombstones: Vec<Tombstone>,
}

impl SyncPayload {
    /// Creates a payload without tombstones.
    pub fn new(todos: Vec<Todo>, sessions: Vec<Session>, settings: Settings) -> Self {
        Self {
            todos,
            sessions,
            settings,
            tombstones: Vec::new(),
        }
    }

    /// Parses and validates a payload received from a peer.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let payload: SyncPayload = serde_json::from_value(value)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Checks that ids are non-empty and unique within each collection.
    pub fn validate(&self) -> ProtocolResult<()> {
        check_ids(&self.todos)?;
        check_ids(&self.sessions)?;
        Ok(())
    }

    /// Looks up a todo by id.
    pub fn todo(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|t| t.id == id)
    }

    /// Looks up a session by id.
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

fn check_ids<T: Keyed>(items: &[T]) -> ProtocolResult<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.id().is_empty() {
            return Err(ProtocolError::invalid_payload(format!(
                "empty id in {}",
                T::TARGET
            )));
        }
        if !seen.insert(item.id()) {
            return Err(ProtocolError::invalid_payload(format!(
                "duplicate id {} in {}",
                item.id(),
                T::TARGET
            )));
        }
    }
    Ok(())
}

/// Deserializes an optional payload, mapping any structurally invalid
/// payload to `None` instead of failing the enclosing message.
pub(crate) fn lenient<'de, D>(deserializer: D) -> Result<Option<SyncPayload>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(value) => match SyncPayload::from_value(value) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!(error = %err, "discarding malformed remote payload");
                None
            }
        },
    })
}

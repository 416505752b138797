//! The synced data model.
//!
//! Every todo and session is keyed by a stable id and carries an `updatedAt`
//! timestamp in epoch milliseconds. Settings are a singleton. Fields this
//! crate does not interpret are preserved in `extra` so that newer peers can
//! add fields without older peers dropping them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One of the three synced collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The todo list.
    Todos,
    /// Completed work sessions.
    Sessions,
    /// The settings singleton.
    Settings,
}

impl Target {
    /// Returns the wire name of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Todos => "todos",
            Target::Sessions => "sessions",
            Target::Settings => "settings",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An item stored in a keyed collection.
pub trait Keyed {
    /// The collection this item belongs to.
    const TARGET: Target;

    /// Stable unique id within the collection.
    fn id(&self) -> &str;

    /// Last local mutation time in epoch milliseconds.
    fn updated_at(&self) -> i64;
}

/// A task on the todo list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    /// Unique id.
    pub id: String,
    /// Task text.
    pub content: String,
    /// Completion flag.
    #[serde(default)]
    pub done: bool,
    /// Estimated effort in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimation_minutes: Option<u32>,
    /// Priority quadrant label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quadrant: Option<String>,
    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
    /// Last mutation time in epoch milliseconds.
    pub updated_at: i64,
    /// Fields not interpreted by the sync layer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Todo {
    /// Creates a todo created and last updated at `now`.
    pub fn new(id: impl Into<String>, content: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            done: false,
            estimation_minutes: None,
            quadrant: None,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Returns true if the fields that matter for reconciliation are equal.
    ///
    /// Timestamps and extra fields are not compared.
    pub fn same_content(&self, other: &Todo) -> bool {
        self.content == other.content
            && self.done == other.done
            && self.estimation_minutes == other.estimation_minutes
            && self.quadrant == other.quadrant
    }
}

impl Keyed for Todo {
    const TARGET: Target = Target::Todos;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

/// A completed (or running) work session. Treated as an immutable fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique id.
    pub id: String,
    /// The todo the session was spent on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<String>,
    /// Start time in epoch milliseconds.
    #[serde(default)]
    pub started_at: i64,
    /// End time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Last mutation time in epoch milliseconds.
    #[serde(default)]
    pub updated_at: i64,
    /// Fields not interpreted by the sync layer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Creates a session that started at `started_at`.
    pub fn new(id: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: id.into(),
            todo_id: None,
            started_at,
            ended_at: None,
            updated_at: started_at,
            extra: Map::new(),
        }
    }
}

impl Keyed for Session {
    const TARGET: Target = Target::Sessions;

    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

/// User settings.
///
/// `muted` is device-local: it is never compared and always kept from the
/// local copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Last mutation time in epoch milliseconds.
    #[serde(default)]
    pub updated_at: i64,
    /// Audio mute flag, local to this device.
    #[serde(default)]
    pub muted: bool,
    /// Synced setting values.
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl Settings {
    /// Returns a copy with `key` set to `value`.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Returns true if the synced values are equal, ignoring `muted` and timestamps.
    pub fn same_values(&self, other: &Settings) -> bool {
        self.values == other.values
    }

    /// Adopts `other`'s synced values while keeping this device's `muted` flag.
    pub fn adopt(&self, other: &Settings) -> Settings {
        Settings {
            updated_at: other.updated_at,
            muted: self.muted,
            values: other.values.clone(),
        }
    }
}

/// Marker recording that an item was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Collection of the deleted item.
    pub target: Target,
    /// Id of the deleted item.
    pub id: String,
    /// Deletion time in epoch milliseconds.
    pub deleted_at: i64,
}

impl Tombstone {
    /// Creates a tombstone.
    pub fn new(target: Target, id: impl Into<String>, deleted_at: i64) -> Self {
        Self {
            target,
            id: id.into(),
            deleted_at,
        }
    }

    /// Returns true if this tombstone hides `item`.
    ///
    /// An item edited after its deletion survives.
    pub fn buries<T: Keyed>(&self, item: &T) -> bool {
        self.target == T::TARGET && self.id == item.id() && self.deleted_at >= item.updated_at()
    }
}

/// Records a deletion, keeping the latest `deletedAt` per item.
///
/// Returns true if the tombstone set changed.
pub(crate) fn record_tombstone(tombstones: &mut Vec<Tombstone>, tombstone: Tombstone) -> bool {
    match tombstones
        .iter_mut()
        .find(|t| t.target == tombstone.target && t.id == tombstone.id)
    {
        Some(existing) if existing.deleted_at >= tombstone.deleted_at => false,
        Some(existing) => {
            existing.deleted_at = tombstone.deleted_at;
            true
        }
        None => {
            tombstones.push(tombstone);
            true
        }
    }
}

/// Returns true if any tombstone hides `item`.
pub(crate) fn is_buried<T: Keyed>(tombstones: &[Tombstone], item: &T) -> bool {
    tombstones.iter().any(|t| t.buries(item))
}

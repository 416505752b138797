//! Incremental mutations and their idempotent application.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{is_buried, record_tombstone, Keyed, Session, Settings, Target, Todo, Tombstone};
use crate::payload::SyncPayload;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Insert a new item.
    Add,
    /// Replace an existing item.
    Update,
    /// Remove an item.
    Delete,
}

/// One mutation of a synced collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    /// Collection being mutated.
    pub target: Target,
    /// Kind of mutation.
    pub action: ChangeAction,
    /// Time of the mutation in epoch milliseconds.
    pub timestamp: i64,
    /// Id of the mutated item. Required for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// The full item for adds and updates.
    #[serde(default)]
    pub data: Value,
}

impl SyncChange {
    /// A todo was created.
    pub fn add_todo(todo: &Todo) -> ProtocolResult<Self> {
        Self::upsert(ChangeAction::Add, todo)
    }

    /// A todo was edited.
    pub fn update_todo(todo: &Todo) -> ProtocolResult<Self> {
        Self::upsert(ChangeAction::Update, todo)
    }

    /// A todo was deleted.
    pub fn delete_todo(id: impl Into<String>, timestamp: i64) -> Self {
        Self::delete(Target::Todos, id.into(), timestamp)
    }

    /// A session was recorded.
    pub fn add_session(session: &Session) -> ProtocolResult<Self> {
        Self::upsert(ChangeAction::Add, session)
    }

    /// A session was edited.
    pub fn update_session(session: &Session) -> ProtocolResult<Self> {
        Self::upsert(ChangeAction::Update, session)
    }

    /// A session was deleted.
    pub fn delete_session(id: impl Into<String>, timestamp: i64) -> Self {
        Self::delete(Target::Sessions, id.into(), timestamp)
    }

    /// Settings were edited.
    pub fn update_settings(settings: &Settings) -> ProtocolResult<Self> {
        Ok(Self {
            target: Target::Settings,
            action: ChangeAction::Update,
            timestamp: settings.updated_at,
            item_id: None,
            data: serde_json::to_value(settings)?,
        })
    }

    fn upsert<T: Keyed + Serialize>(action: ChangeAction, item: &T) -> ProtocolResult<Self> {
        Ok(Self {
            target: T::TARGET,
            action,
            timestamp: item.updated_at(),
            item_id: Some(item.id().to_string()),
            data: serde_json::to_value(item)?,
        })
    }

    fn delete(target: Target, id: String, timestamp: i64) -> Self {
        Self {
            target,
            action: ChangeAction::Delete,
            timestamp,
            item_id: Some(id),
            data: Value::Null,
        }
    }

    /// Returns the tombstone a delete leaves behind.
    pub fn tombstone(&self) -> Option<Tombstone> {
        match (self.action, self.target, &self.item_id) {
            (ChangeAction::Delete, Target::Todos | Target::Sessions, Some(id)) => {
                Some(Tombstone::new(self.target, id.clone(), self.timestamp))
            }
            _ => None,
        }
    }

    fn decode(&self) -> ProtocolResult<Op> {
        match (self.target, self.action) {
            (Target::Todos, ChangeAction::Delete) | (Target::Sessions, ChangeAction::Delete) => {
                let id = match &self.item_id {
                    Some(id) if !id.is_empty() => id.clone(),
                    _ => return Err(ProtocolError::invalid_change("delete without itemId")),
                };
                Ok(Op::Delete(Tombstone::new(self.target, id, self.timestamp)))
            }
            (Target::Todos, action) => Ok(Op::Todo(action, self.item::<Todo>()?)),
            (Target::Sessions, action) => Ok(Op::Session(action, self.item::<Session>()?)),
            (Target::Settings, ChangeAction::Delete) => Ok(Op::Noop),
            (Target::Settings, _) => Ok(Op::Settings(
                serde_json::from_value(self.data.clone())
                    .map_err(|e| ProtocolError::invalid_change(format!("settings: {e}")))?,
            )),
        }
    }

    fn item<T: Keyed + DeserializeOwned>(&self) -> ProtocolResult<T> {
        let item: T = serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::invalid_change(format!("{}: {e}", self.target)))?;
        if item.id().is_empty() {
            return Err(ProtocolError::invalid_change(format!(
                "{} item without id",
                self.target
            )));
        }
        if let Some(id) = &self.item_id {
            if id != item.id() {
                return Err(ProtocolError::invalid_change(format!(
                    "itemId {id} does not match data id {}",
                    item.id()
                )));
            }
        }
        Ok(item)
    }
}

enum Op {
    Todo(ChangeAction, Todo),
    Session(ChangeAction, Session),
    Settings(Settings),
    Delete(Tombstone),
    Noop,
}

/// Result of applying a batch of changes.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChanges {
    /// The collections after application.
    pub payload: SyncPayload,
    /// Collections whose items changed.
    pub changed: BTreeSet<Target>,
    /// Whether the tombstone set changed.
    pub tombstones_changed: bool,
}

impl AppliedChanges {
    /// Returns true if nothing changed.
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && !self.tombstones_changed
    }
}

/// Applies incremental changes to a snapshot of the local collections.
///
/// - `add` inserts only if the id is absent
/// - `update` replaces only if the incoming `updatedAt` is strictly greater,
///   and inserts if the id is absent
/// - `delete` removes the item if present and records a tombstone
///
/// Adds and updates older than a tombstone for the same id are ignored.
/// Applying the same batch twice yields the same state as applying it once.
///
/// # Errors
///
/// If any change in the batch is malformed the whole batch is rejected and
/// nothing is applied.
pub fn apply_changes(current: &SyncPayload, changes: &[SyncChange]) -> ProtocolResult<AppliedChanges> {
    let ops = changes
        .iter()
        .map(SyncChange::decode)
        .collect::<ProtocolResult<Vec<_>>>()?;

    let mut payload = current.clone();
    let mut changed = BTreeSet::new();
    let mut tombstones_changed = false;

    for op in ops {
        match op {
            Op::Todo(action, todo) => {
                if apply_upsert(&mut payload.todos, &payload.tombstones, action, todo) {
                    changed.insert(Target::Todos);
                }
            }
            Op::Session(action, session) => {
                if apply_upsert(&mut payload.sessions, &payload.tombstones, action, session) {
                    changed.insert(Target::Sessions);
                }
            }
            Op::Settings(incoming) => {
                if incoming.updated_at > payload.settings.updated_at {
                    payload.settings = payload.settings.adopt(&incoming);
                    changed.insert(Target::Settings);
                }
            }
            Op::Delete(tombstone) => {
                let removed = match tombstone.target {
                    Target::Todos => remove_by_id(&mut payload.todos, &tombstone),
                    Target::Sessions => remove_by_id(&mut payload.sessions, &tombstone),
                    Target::Settings => false,
                };
                if removed {
                    changed.insert(tombstone.target);
                }
                tombstones_changed |= record_tombstone(&mut payload.tombstones, tombstone);
            }
            Op::Noop => {}
        }
    }

    Ok(AppliedChanges {
        payload,
        changed,
        tombstones_changed,
    })
}

fn apply_upsert<T: Keyed>(
    items: &mut Vec<T>,
    tombstones: &[Tombstone],
    action: ChangeAction,
    item: T,
) -> bool {
    if is_buried(tombstones, &item) {
        return false;
    }

    match items.iter().position(|existing| existing.id() == item.id()) {
        None => {
            items.push(item);
            true
        }
        Some(_) if action == ChangeAction::Add => false,
        Some(index) if item.updated_at() > items[index].updated_at() => {
            items[index] = item;
            true
        }
        Some(_) => false,
    }
}

fn remove_by_id<T: Keyed>(items: &mut Vec<T>, tombstone: &Tombstone) -> bool {
    let before = items.len();
    items.retain(|item| item.id() != tombstone.id);
    items.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SyncPayload {
        SyncPayload::new(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Session::new("s1", 500)],
            Settings::default().with_value("theme", "dark"),
        )
    }

    #[test]
    fn add_is_idempotent() {
        let change = SyncChange::add_todo(&Todo::new("t2", "Walk dog", 2000)).unwrap();
        let once = apply_changes(&store(), &[change.clone()]).unwrap();
        assert_eq!(once.payload.todos.len(), 2);
        assert!(once.changed.contains(&Target::Todos));

        let twice = apply_changes(&once.payload, &[change]).unwrap();
        assert_eq!(twice.payload, once.payload);
        assert!(twice.is_noop());
    }

    #[test]
    fn add_does_not_overwrite() {
        let change = SyncChange::add_todo(&Todo::new("t1", "Other", 9000)).unwrap();
        let applied = apply_changes(&store(), &[change]).unwrap();
        assert_eq!(applied.payload.todos[0].content, "Buy milk");
    }

    #[test]
    fn update_is_last_write_wins() {
        let newer = SyncChange::update_todo(&Todo::new("t1", "Buy bread", 2000)).unwrap();
        let applied = apply_changes(&store(), &[newer]).unwrap();
        assert_eq!(applied.payload.todos[0].content, "Buy bread");

        let same = SyncChange::update_todo(&Todo::new("t1", "Buy eggs", 1000)).unwrap();
        let applied = apply_changes(&store(), &[same]).unwrap();
        assert_eq!(applied.payload.todos[0].content, "Buy milk");
    }

    #[test]
    fn update_of_missing_item_adds_it() {
        let change = SyncChange::update_todo(&Todo::new("t9", "New", 1)).unwrap();
        let applied = apply_changes(&store(), &[change]).unwrap();
        assert!(applied.payload.todo("t9").is_some());
    }

    #[test]
    fn delete_removes_and_records_tombstone() {
        let applied = apply_changes(&store(), &[SyncChange::delete_todo("t1", 3000)]).unwrap();
        assert!(applied.payload.todos.is_empty());
        assert!(applied.tombstones_changed);
        assert_eq!(
            applied.payload.tombstones,
            vec![Tombstone::new(Target::Todos, "t1", 3000)]
        );

        let again = apply_changes(&applied.payload, &[SyncChange::delete_todo("t1", 3000)]).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn delete_unknown_is_noop_for_items() {
        let applied = apply_changes(&store(), &[SyncChange::delete_session("nope", 10)]).unwrap();
        assert_eq!(applied.payload.sessions.len(), 1);
        assert!(applied.changed.is_empty());
    }

    #[test]
    fn stale_add_after_delete_is_ignored() {
        let deleted = apply_changes(&store(), &[SyncChange::delete_todo("t1", 3000)]).unwrap();

        let stale = SyncChange::add_todo(&Todo::new("t1", "Buy milk", 1000)).unwrap();
        let applied = apply_changes(&deleted.payload, &[stale]).unwrap();
        assert!(applied.payload.todos.is_empty());

        let revived = SyncChange::update_todo(&Todo::new("t1", "Buy milk", 4000)).unwrap();
        let applied = apply_changes(&deleted.payload, &[revived]).unwrap();
        assert_eq!(applied.payload.todos.len(), 1);
    }

    #[test]
    fn settings_update_keeps_local_muted() {
        let mut local = store();
        local.settings.muted = true;

        let mut incoming = Settings::default().with_value("theme", "light");
        incoming.updated_at = 50;
        let applied =
            apply_changes(&local, &[SyncChange::update_settings(&incoming).unwrap()]).unwrap();
        assert!(applied.payload.settings.muted);
        assert_eq!(applied.payload.settings.values["theme"], "light");
        assert_eq!(applied.payload.settings.updated_at, 50);
    }

    #[test]
    fn malformed_batch_is_rejected_wholesale() {
        let good = SyncChange::add_todo(&Todo::new("t2", "Walk dog", 2000)).unwrap();
        let bad = SyncChange {
            target: Target::Todos,
            action: ChangeAction::Add,
            timestamp: 1,
            item_id: None,
            data: json!({"content": 42}),
        };
        assert!(matches!(
            apply_changes(&store(), &[good, bad]),
            Err(ProtocolError::InvalidChange(_))
        ));
    }

    #[test]
    fn delete_requires_item_id() {
        let change = SyncChange {
            target: Target::Todos,
            action: ChangeAction::Delete,
            timestamp: 1,
            item_id: None,
            data: Value::Null,
        };
        assert!(apply_changes(&store(), &[change]).is_err());
    }

    #[test]
    fn mismatched_item_id_is_rejected() {
        let mut change = SyncChange::update_todo(&Todo::new("t1", "x", 5)).unwrap();
        change.item_id = Some("t2".into());
        assert!(apply_changes(&store(), &[change]).is_err());
    }

    #[test]
    fn change_wire_format() {
        let value = serde_json::to_value(SyncChange::delete_todo("t1", 7)).unwrap();
        assert_eq!(
            value,
            json!({"target": "todos", "action": "delete", "timestamp": 7, "itemId": "t1", "data": null})
        );
    }
}

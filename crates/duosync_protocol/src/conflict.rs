//! Conflict detection results and resolution.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{Keyed, Session, Settings, Target, Todo};
use crate::payload::SyncPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Item id used for the settings singleton in conflicts.
pub(crate) const SETTINGS_ITEM_ID: &str = "settings";

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local version.
    Local,
    /// Take the remote version.
    Remote,
}

impl Resolution {
    /// The same decision seen from the other device.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Resolution::Local => Resolution::Remote,
            Resolution::Remote => Resolution::Local,
        }
    }
}

/// An item both replicas changed within the conflict window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Collection of the item.
    pub target: Target,
    /// Item id (`"settings"` for the settings singleton).
    pub item_id: String,
    /// The item as stored locally.
    pub local_version: Value,
    /// The item as stored by the peer.
    pub remote_version: Value,
    /// Local `updatedAt`.
    pub local_updated_at: i64,
    /// Remote `updatedAt`.
    pub remote_updated_at: i64,
}

impl SyncConflict {
    /// The same conflict seen from the other device.
    #[must_use]
    pub fn swap_perspective(&self) -> Self {
        Self {
            target: self.target,
            item_id: self.item_id.clone(),
            local_version: self.remote_version.clone(),
            remote_version: self.local_version.clone(),
            local_updated_at: self.remote_updated_at,
            remote_updated_at: self.local_updated_at,
        }
    }

    /// Returns true if `resolution` refers to this conflict.
    pub fn matches(&self, resolution: &ResolvedConflict) -> bool {
        self.target == resolution.target && self.item_id == resolution.item_id
    }

    /// Resolves this conflict.
    pub fn resolve(&self, resolution: Resolution) -> ResolvedConflict {
        ResolvedConflict {
            target: self.target,
            item_id: self.item_id.clone(),
            resolution,
        }
    }
}

/// A decision for one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConflict {
    /// Collection of the item.
    pub target: Target,
    /// Item id.
    pub item_id: String,
    /// The winning side.
    pub resolution: Resolution,
}

impl ResolvedConflict {
    /// The same decision seen from the other device.
    #[must_use]
    pub fn flipped(&self) -> Self {
        Self {
            target: self.target,
            item_id: self.item_id.clone(),
            resolution: self.resolution.flip(),
        }
    }
}

/// Automatic conflict resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Local version always wins.
    KeepLocal,
    /// Remote version always wins.
    AcceptRemote,
    /// Most recent `updatedAt` wins; ties keep local.
    #[default]
    LastWriteWins,
}

impl ConflictPolicy {
    /// Decides a conflict.
    pub fn decide(&self, conflict: &SyncConflict) -> Resolution {
        match self {
            ConflictPolicy::KeepLocal => Resolution::Local,
            ConflictPolicy::AcceptRemote => Resolution::Remote,
            ConflictPolicy::LastWriteWins => {
                if conflict.remote_updated_at > conflict.local_updated_at {
                    Resolution::Remote
                } else {
                    Resolution::Local
                }
            }
        }
    }

    /// Decides every conflict, in order.
    pub fn resolve_all(&self, conflicts: &[SyncConflict]) -> Vec<ResolvedConflict> {
        conflicts
            .iter()
            .map(|c| c.resolve(self.decide(c)))
            .collect()
    }
}

/// Writes the winning version of `conflict` into `payload`.
///
/// The chosen version is written even when it is the local one, since the
/// store may hold the peer's provisional version at this point. Returns the
/// collection that changed.
pub fn apply_resolution(
    payload: &mut SyncPayload,
    conflict: &SyncConflict,
    resolution: Resolution,
) -> ProtocolResult<Target> {
    let winner = match resolution {
        Resolution::Local => conflict.local_version.clone(),
        Resolution::Remote => conflict.remote_version.clone(),
    };

    match conflict.target {
        Target::Todos => {
            let todo: Todo = serde_json::from_value(winner)?;
            check_id(&todo.id, conflict)?;
            upsert(&mut payload.todos, todo);
        }
        Target::Sessions => {
            let session: Session = serde_json::from_value(winner)?;
            check_id(&session.id, conflict)?;
            upsert(&mut payload.sessions, session);
        }
        Target::Settings => {
            let settings: Settings = serde_json::from_value(winner)?;
            payload.settings = payload.settings.adopt(&settings);
        }
    }
    Ok(conflict.target)
}

fn check_id(id: &str, conflict: &SyncConflict) -> ProtocolResult<()> {
    if id == conflict.item_id {
        Ok(())
    } else {
        Err(ProtocolError::invalid_change(format!(
            "conflict for {} carries item {}",
            conflict.item_id, id
        )))
    }
}

pub(crate) fn upsert<T: Keyed>(items: &mut Vec<T>, item: T) {
    match items.iter().position(|existing| existing.id() == item.id()) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo_conflict(local: &Todo, remote: &Todo) -> SyncConflict {
        SyncConflict {
            target: Target::Todos,
            item_id: local.id.clone(),
            local_version: serde_json::to_value(local).unwrap(),
            remote_version: serde_json::to_value(remote).unwrap(),
            local_updated_at: local.updated_at,
            remote_updated_at: remote.updated_at,
        }
    }

    #[test]
    fn swap_perspective_roundtrip() {
        let conflict = todo_conflict(
            &Todo::new("t1", "Buy milk", 1000),
            &Todo::new("t1", "Buy bread", 3000),
        );
        let swapped = conflict.swap_perspective();
        assert_eq!(swapped.local_updated_at, 3000);
        assert_eq!(swapped.local_version["content"], "Buy bread");
        assert_eq!(swapped.swap_perspective(), conflict);
    }

    #[test]
    fn resolution_flip() {
        let resolved = ResolvedConflict {
            target: Target::Todos,
            item_id: "t1".into(),
            resolution: Resolution::Local,
        };
        assert_eq!(resolved.flipped().resolution, Resolution::Remote);
        assert_eq!(resolved.flipped().flipped(), resolved);
    }

    #[test]
    fn policies() {
        let conflict = todo_conflict(
            &Todo::new("t1", "Buy milk", 1000),
            &Todo::new("t1", "Buy bread", 3000),
        );
        assert_eq!(ConflictPolicy::KeepLocal.decide(&conflict), Resolution::Local);
        assert_eq!(ConflictPolicy::AcceptRemote.decide(&conflict), Resolution::Remote);
        assert_eq!(ConflictPolicy::LastWriteWins.decide(&conflict), Resolution::Remote);
        assert_eq!(
            ConflictPolicy::LastWriteWins.decide(&conflict.swap_perspective()),
            Resolution::Local
        );
    }

    #[test]
    fn apply_remote_resolution() {
        let local = Todo::new("t1", "Buy milk", 1000);
        let remote = Todo::new("t1", "Buy bread", 3000);
        let mut payload = SyncPayload::new(vec![local.clone()], vec![], Settings::default());

        let conflict = todo_conflict(&local, &remote);
        apply_resolution(&mut payload, &conflict, Resolution::Remote).unwrap();
        assert_eq!(payload.todos, vec![remote]);
    }

    #[test]
    fn apply_local_resolution_restores_local_version() {
        let local = Todo::new("t1", "Buy milk", 1000);
        let remote = Todo::new("t1", "Buy bread", 3000);
        // Store holds the peer's provisional merge result
        let mut payload = SyncPayload::new(vec![remote.clone()], vec![], Settings::default());

        let conflict = todo_conflict(&local, &remote);
        apply_resolution(&mut payload, &conflict, Resolution::Local).unwrap();
        assert_eq!(payload.todos, vec![local]);
    }

    #[test]
    fn settings_resolution_keeps_muted() {
        let mut local = Settings::default().with_value("theme", "dark");
        local.muted = true;
        let remote = Settings::default().with_value("theme", "light");
        let conflict = SyncConflict {
            target: Target::Settings,
            item_id: SETTINGS_ITEM_ID.into(),
            local_version: serde_json::to_value(&local).unwrap(),
            remote_version: serde_json::to_value(&remote).unwrap(),
            local_updated_at: 0,
            remote_updated_at: 0,
        };

        let mut payload = SyncPayload::new(vec![], vec![], local);
        apply_resolution(&mut payload, &conflict, Resolution::Remote).unwrap();
        assert!(payload.settings.muted);
        assert_eq!(payload.settings.values["theme"], "light");
    }

    #[test]
    fn mismatched_item_is_rejected() {
        let mut conflict = todo_conflict(
            &Todo::new("t1", "Buy milk", 1000),
            &Todo::new("t1", "Buy bread", 3000),
        );
        conflict.item_id = "t2".into();
        let mut payload = SyncPayload::default();
        assert!(apply_resolution(&mut payload, &conflict, Resolution::Remote).is_err());
    }
}

//! Full reconciliation of two replicas.
//!
//! All functions here are pure: they take both snapshots and return a new
//! merged snapshot plus the conflicts that need a decision. Output order is
//! deterministic (local items in local order, then remote-only items in
//! remote order).

use crate::conflict::{SyncConflict, SETTINGS_ITEM_ID};
use crate::model::{is_buried, record_tombstone, Keyed, Session, Settings, Target, Todo, Tombstone};
use crate::payload::SyncPayload;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Two edits closer together than this are treated as concurrent.
pub const DEFAULT_CONFLICT_WINDOW_MS: i64 = 5_000;

/// Result of a full merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    /// The merged snapshot. Conflicted items hold the local version.
    pub payload: SyncPayload,
    /// Items that need a resolution, from the local perspective.
    pub conflicts: Vec<SyncConflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pick {
    Local,
    Remote,
    Conflict,
}

fn pick(same: bool, local_at: i64, remote_at: i64, window_ms: i64) -> Pick {
    if same {
        Pick::Local
    } else if local_at.abs_diff(remote_at) < window_ms.max(0) as u64 {
        Pick::Conflict
    } else if remote_at > local_at {
        Pick::Remote
    } else {
        Pick::Local
    }
}

fn conflict_for<T: Serialize>(
    target: Target,
    item_id: &str,
    local: &T,
    remote: &T,
    local_updated_at: i64,
    remote_updated_at: i64,
) -> SyncConflict {
    SyncConflict {
        target,
        item_id: item_id.to_string(),
        local_version: serde_json::to_value(local).unwrap_or_default(),
        remote_version: serde_json::to_value(remote).unwrap_or_default(),
        local_updated_at,
        remote_updated_at,
    }
}

/// Merges two todo lists.
///
/// Items present on one side are kept. For items on both sides: equal
/// content keeps local; a difference within `window_ms` is a conflict (local
/// kept provisionally); otherwise the strictly newer side wins and ties keep
/// local.
pub fn merge_todos(local: &[Todo], remote: &[Todo], window_ms: i64) -> (Vec<Todo>, Vec<SyncConflict>) {
    let remote_by_id: HashMap<&str, &Todo> = remote.iter().map(|t| (t.id.as_str(), t)).collect();
    let local_ids: HashSet<&str> = local.iter().map(|t| t.id.as_str()).collect();

    let mut merged = Vec::with_capacity(local.len().max(remote.len()));
    let mut conflicts = Vec::new();

    for mine in local {
        let Some(theirs) = remote_by_id.get(mine.id.as_str()) else {
            merged.push(mine.clone());
            continue;
        };
        match pick(mine.same_content(theirs), mine.updated_at, theirs.updated_at, window_ms) {
            Pick::Local => merged.push(mine.clone()),
            Pick::Remote => merged.push((*theirs).clone()),
            Pick::Conflict => {
                conflicts.push(conflict_for(
                    Target::Todos,
                    &mine.id,
                    mine,
                    *theirs,
                    mine.updated_at,
                    theirs.updated_at,
                ));
                merged.push(mine.clone());
            }
        }
    }

    merged.extend(
        remote
            .iter()
            .filter(|t| !local_ids.contains(t.id.as_str()))
            .cloned(),
    );

    (merged, conflicts)
}

/// Merges two session lists as a union by id.
///
/// Sessions never conflict. When both sides hold a session the newer copy is
/// kept, ties keep local.
pub fn merge_sessions(local: &[Session], remote: &[Session]) -> Vec<Session> {
    let remote_by_id: HashMap<&str, &Session> =
        remote.iter().map(|s| (s.id.as_str(), s)).collect();
    let local_ids: HashSet<&str> = local.iter().map(|s| s.id.as_str()).collect();

    let mut merged: Vec<Session> = local
        .iter()
        .map(|mine| match remote_by_id.get(mine.id.as_str()) {
            Some(theirs) if theirs.updated_at > mine.updated_at => (*theirs).clone(),
            _ => mine.clone(),
        })
        .collect();

    merged.extend(
        remote
            .iter()
            .filter(|s| !local_ids.contains(s.id.as_str()))
            .cloned(),
    );
    merged
}

/// Merges the settings singleton with the same rule as todos.
///
/// The local `muted` flag is kept whatever the outcome.
pub fn merge_settings(
    local: &Settings,
    remote: &Settings,
    window_ms: i64,
) -> (Settings, Option<SyncConflict>) {
    match pick(
        local.same_values(remote),
        local.updated_at,
        remote.updated_at,
        window_ms,
    ) {
        Pick::Local => (local.clone(), None),
        Pick::Remote => (local.adopt(remote), None),
        Pick::Conflict => (
            local.clone(),
            Some(conflict_for(
                Target::Settings,
                SETTINGS_ITEM_ID,
                local,
                remote,
                local.updated_at,
                remote.updated_at,
            )),
        ),
    }
}

/// Unions two tombstone sets, keeping the latest deletion per item.
pub fn merge_tombstones(local: &[Tombstone], remote: &[Tombstone]) -> Vec<Tombstone> {
    let mut merged = local.to_vec();
    for tombstone in remote {
        record_tombstone(&mut merged, tombstone.clone());
    }
    merged
}

/// Drops tombstones older than `retention_ms` relative to `now`.
pub fn prune_tombstones(tombstones: &mut Vec<Tombstone>, now: i64, retention_ms: i64) {
    tombstones.retain(|t| now.saturating_sub(t.deleted_at) <= retention_ms);
}

fn bury<T: Keyed>(items: Vec<T>, tombstones: &[Tombstone]) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| !is_buried(tombstones, item))
        .collect()
}

/// Merges a local snapshot with a peer's snapshot.
///
/// `remote` is `None` when the peer sent nothing usable; the local snapshot
/// is then returned as is, apart from tombstone filtering. Conflicts for
/// items that a tombstone removes are dropped.
pub fn merge_payloads(local: &SyncPayload, remote: Option<&SyncPayload>, window_ms: i64) -> MergeOutcome {
    let Some(remote) = remote else {
        let tombstones = local.tombstones.clone();
        return MergeOutcome {
            payload: SyncPayload {
                todos: bury(local.todos.clone(), &tombstones),
                sessions: bury(local.sessions.clone(), &tombstones),
                settings: local.settings.clone(),
                tombstones,
            },
            conflicts: Vec::new(),
        };
    };

    let tombstones = merge_tombstones(&local.tombstones, &remote.tombstones);
    let (todos, mut conflicts) = merge_todos(&local.todos, &remote.todos, window_ms);
    let sessions = merge_sessions(&local.sessions, &remote.sessions);
    let (settings, settings_conflict) = merge_settings(&local.settings, &remote.settings, window_ms);

    let todos = bury(todos, &tombstones);
    let sessions = bury(sessions, &tombstones);
    conflicts.retain(|c| c.target != Target::Todos || todos.iter().any(|t| t.id == c.item_id));
    conflicts.extend(settings_conflict);

    MergeOutcome {
        payload: SyncPayload {
            todos,
            sessions,
            settings,
            tombstones,
        },
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = DEFAULT_CONFLICT_WINDOW_MS;

    #[test]
    fn one_sided_items_are_kept() {
        let local = vec![Todo::new("a", "A", 1)];
        let remote = vec![Todo::new("b", "B", 2)];
        let (merged, conflicts) = merge_todos(&local, &remote, WINDOW);
        assert_eq!(merged.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn newer_remote_wins_outside_window() {
        let local = vec![Todo::new("t1", "Buy milk", 1000)];
        let remote = vec![Todo::new("t1", "Buy bread", 9000)];
        let (merged, conflicts) = merge_todos(&local, &remote, WINDOW);
        assert_eq!(merged[0].content, "Buy bread");
        assert!(conflicts.is_empty());
    }

    #[test]
    fn concurrent_edits_conflict() {
        let local = vec![Todo::new("t1", "Buy milk", 1000)];
        let remote = vec![Todo::new("t1", "Buy bread", 3000)];
        let (merged, conflicts) = merge_todos(&local, &remote, WINDOW);
        assert_eq!(merged[0].content, "Buy milk");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].item_id, "t1");
        assert_eq!(conflicts[0].remote_version["content"], "Buy bread");
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let local = vec![Todo::new("t1", "A", 0)];
        let remote = vec![Todo::new("t1", "B", WINDOW)];
        let (merged, conflicts) = merge_todos(&local, &remote, WINDOW);
        assert!(conflicts.is_empty());
        assert_eq!(merged[0].content, "B");
    }

    #[test]
    fn sessions_union() {
        let local = vec![Session::new("s1", 1), Session::new("s2", 2)];
        let mut ended = Session::new("s2", 2);
        ended.ended_at = Some(10);
        ended.updated_at = 10;
        let remote = vec![ended.clone(), Session::new("s3", 3)];

        let merged = merge_sessions(&local, &remote);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1], ended);
    }

    #[test]
    fn settings_keep_local_muted() {
        let mut local = Settings::default().with_value("theme", "dark");
        local.muted = true;
        let mut remote = Settings::default().with_value("theme", "light");
        remote.updated_at = 60_000;

        let (merged, conflict) = merge_settings(&local, &remote, WINDOW);
        assert!(conflict.is_none());
        assert!(merged.muted);
        assert_eq!(merged.values["theme"], "light");
    }

    #[test]
    fn settings_conflict() {
        let local = Settings::default().with_value("theme", "dark");
        let remote = Settings::default().with_value("theme", "light");
        let (merged, conflict) = merge_settings(&local, &remote, WINDOW);
        assert_eq!(merged, local);
        assert_eq!(conflict.unwrap().target, Target::Settings);
    }

    #[test]
    fn tombstones_remove_older_items() {
        let local = SyncPayload {
            tombstones: vec![Tombstone::new(Target::Todos, "t1", 5000)],
            ..Default::default()
        };
        let remote = SyncPayload::new(
            vec![Todo::new("t1", "Buy milk", 1000), Todo::new("t2", "Later", 6000)],
            vec![],
            Settings::default(),
        );

        let outcome = merge_payloads(&local, Some(&remote), WINDOW);
        assert_eq!(outcome.payload.todos.len(), 1);
        assert_eq!(outcome.payload.todos[0].id, "t2");
        assert_eq!(outcome.payload.tombstones.len(), 1);
    }

    #[test]
    fn edit_after_delete_survives() {
        let local = SyncPayload {
            tombstones: vec![Tombstone::new(Target::Todos, "t1", 5000)],
            ..Default::default()
        };
        let remote = SyncPayload::new(vec![Todo::new("t1", "Edited", 7000)], vec![], Settings::default());
        let outcome = merge_payloads(&local, Some(&remote), WINDOW);
        assert_eq!(outcome.payload.todos.len(), 1);
    }

    #[test]
    fn missing_remote_keeps_local() {
        let local = SyncPayload::new(vec![Todo::new("t1", "A", 1)], vec![], Settings::default());
        let outcome = merge_payloads(&local, None, WINDOW);
        assert_eq!(outcome.payload, local);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn prune_drops_expired_tombstones() {
        let mut tombstones = vec![
            Tombstone::new(Target::Todos, "old", 0),
            Tombstone::new(Target::Todos, "new", 900),
        ];
        prune_tombstones(&mut tombstones, 1000, 500);
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, "new");
    }
}

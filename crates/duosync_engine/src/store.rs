//! Local data store port.

use crate::error::SyncResult;
use duosync_protocol::{Session, Settings, SyncPayload, Todo, Tombstone};
use parking_lot::RwLock;

/// The application's local store for the synced collections.
///
/// Each save replaces the whole collection. The engine is the only writer
/// while it applies a merge.
pub trait LocalStore: Send + Sync {
    /// Reads all todos.
    fn todos(&self) -> SyncResult<Vec<Todo>>;

    /// Replaces all todos.
    fn save_todos(&self, todos: Vec<Todo>) -> SyncResult<()>;

    /// Reads all sessions.
    fn sessions(&self) -> SyncResult<Vec<Session>>;

    /// Replaces all sessions.
    fn save_sessions(&self, sessions: Vec<Session>) -> SyncResult<()>;

    /// Reads the settings.
    fn settings(&self) -> SyncResult<Settings>;

    /// Replaces the settings.
    fn save_settings(&self, settings: Settings) -> SyncResult<()>;

    /// Reads deletion markers. Stores without tombstone support return none.
    fn tombstones(&self) -> SyncResult<Vec<Tombstone>> {
        Ok(Vec::new())
    }

    /// Replaces deletion markers.
    fn save_tombstones(&self, _tombstones: Vec<Tombstone>) -> SyncResult<()> {
        Ok(())
    }
}

/// Reads a full snapshot from `store`.
pub fn snapshot<S: LocalStore + ?Sized>(store: &S) -> SyncResult<SyncPayload> {
    Ok(SyncPayload {
        todos: store.todos()?,
        sessions: store.sessions()?,
        settings: store.settings()?,
        tombstones: store.tombstones()?,
    })
}

/// Writes every collection of `next` that differs from `previous`.
///
/// Returns the number of collections written.
pub fn write_changes<S: LocalStore + ?Sized>(
    store: &S,
    previous: &SyncPayload,
    next: &SyncPayload,
) -> SyncResult<usize> {
    let mut written = 0;
    if next.todos != previous.todos {
        store.save_todos(next.todos.clone())?;
        written += 1;
    }
    if next.sessions != previous.sessions {
        store.save_sessions(next.sessions.clone())?;
        written += 1;
    }
    if next.settings != previous.settings {
        store.save_settings(next.settings.clone())?;
        written += 1;
    }
    if next.tombstones != previous.tombstones {
        store.save_tombstones(next.tombstones.clone())?;
        written += 1;
    }
    Ok(written)
}

/// An in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<SyncPayload>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `payload`.
    pub fn with_payload(payload: SyncPayload) -> Self {
        Self {
            data: RwLock::new(payload),
        }
    }

    /// Returns a copy of everything in the store.
    pub fn contents(&self) -> SyncPayload {
        self.data.read().clone()
    }

    /// Inserts or replaces a todo.
    pub fn put_todo(&self, todo: Todo) {
        let mut data = self.data.write();
        match data.todos.iter_mut().find(|t| t.id == todo.id) {
            Some(existing) => *existing = todo,
            None => data.todos.push(todo),
        }
    }

    /// Removes a todo.
    pub fn remove_todo(&self, id: &str) {
        self.data.write().todos.retain(|t| t.id != id);
    }

    /// Inserts or replaces a session.
    pub fn put_session(&self, session: Session) {
        let mut data = self.data.write();
        match data.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => data.sessions.push(session),
        }
    }
}

impl LocalStore for MemoryStore {
    fn todos(&self) -> SyncResult<Vec<Todo>> {
        Ok(self.data.read().todos.clone())
    }

    fn save_todos(&self, todos: Vec<Todo>) -> SyncResult<()> {
        self.data.write().todos = todos;
        Ok(())
    }

    fn sessions(&self) -> SyncResult<Vec<Session>> {
        Ok(self.data.read().sessions.clone())
    }

    fn save_sessions(&self, sessions: Vec<Session>) -> SyncResult<()> {
        self.data.write().sessions = sessions;
        Ok(())
    }

    fn settings(&self) -> SyncResult<Settings> {
        Ok(self.data.read().settings.clone())
    }

    fn save_settings(&self, settings: Settings) -> SyncResult<()> {
        self.data.write().settings = settings;
        Ok(())
    }

    fn tombstones(&self) -> SyncResult<Vec<Tombstone>> {
        Ok(self.data.read().tombstones.clone())
    }

    fn save_tombstones(&self, tombstones: Vec<Tombstone>) -> SyncResult<()> {
        self.data.write().tombstones = tombstones;
        Ok(())
    }
}

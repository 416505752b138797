//! Sync engine.
//!
//! Translates local mutations into peer messages and peer messages into
//! local store writes. The engine is a plain state machine: every method
//! takes `&mut self`, and [`spawn_engine`](crate::spawn_engine) runs it on
//! a single task so store writes never interleave.
//!
//! ## Protocol flow per connection
//!
//! ```text
//! Dialer                                   Listener
//!   │── hello ──────────────────────────────▶│
//!   │◀────────────────────────────── hello ──│
//!   │── incremental-update (queued) ────────▶│
//!   │── full-sync-request ──────────────────▶│  merge, write, prune
//!   │◀──────────────── full-sync-response ───│
//!   │  write merged data                     │
//!   │◀─────────── conflict-resolution ───────│  (if awaitingResolution)
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus, Role};
use crate::error::{SyncError, SyncResult};
use crate::store::{snapshot, write_changes, LocalStore};
use crate::sync_config::ConfigStore;
use crate::transport::Transport;
use async_trait::async_trait;
use duosync_protocol::{
    apply_changes, apply_resolution, merge_payloads, merge_tombstones, prune_tombstones, Ack,
    ConflictPolicy, FullSyncRequest, FullSyncResponse, Hello, IncrementalUpdate, ResolvedConflict,
    SyncChange, SyncConflict, SyncMessage, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Outbound side of the connection, as seen by the engine.
pub trait MessageSink: Send + Sync + 'static {
    /// Sends `message`. Returns false if no channel is open.
    fn send_message(&self, message: &SyncMessage) -> bool;

    /// This side's role, once known.
    fn role(&self) -> Option<Role>;
}

impl<T: Transport> MessageSink for ConnectionManager<T> {
    fn send_message(&self, message: &SyncMessage) -> bool {
        self.send(message)
    }

    fn role(&self) -> Option<Role> {
        ConnectionManager::role(self)
    }
}

/// Decides conflicts, typically by asking the user.
///
/// The engine waits for the answer as long as it takes.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Returns one decision per conflict, in the same order.
    async fn resolve(&self, conflicts: Vec<SyncConflict>) -> Vec<ResolvedConflict>;
}

/// Resolves conflicts with a fixed [`ConflictPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyResolver(pub ConflictPolicy);

#[async_trait]
impl ConflictResolver for PolicyResolver {
    async fn resolve(&self, conflicts: Vec<SyncConflict>) -> Vec<ResolvedConflict> {
        self.0.resolve_all(&conflicts)
    }
}

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No channel.
    #[default]
    Idle,
    /// A full sync request is outstanding.
    AwaitingFullSync,
    /// Conflicts wait for a decision.
    Resolving,
    /// Connected and exchanging incremental updates.
    Live,
}

impl SyncState {
    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }

    /// Returns true if conflicts block convergence.
    pub fn is_resolving(&self) -> bool {
        matches!(self, SyncState::Resolving)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Full syncs completed.
    pub full_syncs: u64,
    /// Changes sent in incremental updates.
    pub changes_sent: u64,
    /// Changes received in incremental updates.
    pub changes_received: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Messages rejected as malformed.
    pub messages_rejected: u64,
    /// Completion time of the last full sync.
    pub last_sync_at: Option<i64>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Shared read-only view of an engine.
#[derive(Debug, Default)]
pub struct EngineMonitor {
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl EngineMonitor {
    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "sync state changed");
        }
    }

    fn record(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut *self.stats.write());
    }

    fn record_error(&self, error: &SyncError) {
        self.stats.write().last_error = Some(error.to_string());
    }
}

/// Reconciles the local store with the paired peer.
pub struct SyncEngine<S: LocalStore, K: MessageSink> {
    store: Arc<S>,
    sink: Arc<K>,
    config_store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    config: EngineConfig,
    monitor: Arc<EngineMonitor>,
    device_id: String,
    expected_peer: Option<String>,
    pending: VecDeque<SyncChange>,
    in_flight: BTreeMap<i64, Vec<SyncChange>>,
    pending_conflicts: Vec<SyncConflict>,
    unsent_resolutions: Vec<ResolvedConflict>,
    last_batch_ts: i64,
}

impl<S: LocalStore, K: MessageSink> SyncEngine<S, K> {
    /// Creates an engine for the device described by `config_store`.
    pub fn new(store: Arc<S>, sink: Arc<K>, config_store: Arc<dyn ConfigStore>) -> SyncResult<Self> {
        let device = config_store.load()?;
        Ok(Self {
            store,
            sink,
            config_store,
            clock: Arc::new(SystemClock),
            resolver: None,
            config: EngineConfig::default(),
            monitor: Arc::new(EngineMonitor::default()),
            device_id: device.device_id,
            expected_peer: device.peer_device_id,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            pending_conflicts: Vec::new(),
            unsent_resolutions: Vec::new(),
            last_batch_ts: 0,
        })
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared view of state and stats.
    pub fn monitor(&self) -> Arc<EngineMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.monitor.state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.monitor.stats()
    }

    /// Changes waiting for a channel.
    pub fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    /// Batches sent but not yet acknowledged.
    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.len()
    }

    /// Conflicts waiting for a decision, from the local perspective.
    pub fn pending_conflicts(&self) -> &[SyncConflict] {
        &self.pending_conflicts
    }

    /// Dispatches a connection event. Errors are logged and recorded.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        let result = match event {
            ConnectionEvent::StatusChanged(ConnectionStatus::Connected) => {
                self.on_connected().await
            }
            ConnectionEvent::StatusChanged(
                ConnectionStatus::Disconnected | ConnectionStatus::Error,
            ) => {
                self.on_disconnected();
                Ok(())
            }
            ConnectionEvent::StatusChanged(ConnectionStatus::Connecting) => Ok(()),
            ConnectionEvent::Message(raw) => self.handle_message(&raw).await,
            ConnectionEvent::Error(err) => {
                tracing::debug!(error = %err, "connection reported an error");
                Err(err.into())
            }
        };

        if let Err(err) = result {
            match &err {
                SyncError::Connection(_) => {}
                _ => tracing::warn!(error = %err, "sync step failed"),
            }
            self.monitor.record_error(&err);
        }
    }

    /// Runs the connection-open sequence.
    ///
    /// Sends `hello`, flushes unsent resolutions and queued changes, and
    /// starts a full sync when this side dialed.
    pub async fn on_connected(&mut self) -> SyncResult<()> {
        tracing::info!(device_id = %self.device_id, "peer connected");
        self.monitor.set_state(SyncState::Live);

        let hello = SyncMessage::hello(self.clock.now_millis(), &self.device_id);
        if !self.sink.send_message(&hello) {
            return Err(SyncError::SendFailed("hello".into()));
        }
        self.flush_resolutions();
        self.flush_pending();

        if self.sink.role() == Some(Role::Dialer) {
            self.request_full_sync()?;
        }
        Ok(())
    }

    /// Moves unacknowledged batches back to the queue.
    pub fn on_disconnected(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        if !in_flight.is_empty() {
            let mut requeued: VecDeque<SyncChange> = in_flight.into_values().flatten().collect();
            tracing::debug!(changes = requeued.len(), "re-queueing unacknowledged changes");
            requeued.extend(self.pending.drain(..));
            self.pending = requeued;
        }
        if self.monitor.state() != SyncState::Idle {
            tracing::info!(device_id = %self.device_id, "peer disconnected");
        }
        self.monitor.set_state(SyncState::Idle);
    }

    /// Sends this device's snapshot as a `full-sync-request`.
    pub fn request_full_sync(&mut self) -> SyncResult<()> {
        let data = snapshot(&*self.store)?;
        let message = SyncMessage::full_sync_request(self.clock.now_millis(), data);
        if !self.sink.send_message(&message) {
            return Err(SyncError::SendFailed(message.kind().into()));
        }
        tracing::debug!("full sync requested");
        self.monitor.set_state(SyncState::AwaitingFullSync);
        Ok(())
    }

    /// Captures a local mutation and sends it if a channel is open.
    ///
    /// The application writes its store first. Deletes also leave a
    /// tombstone in the store. Returns false if the change was queued.
    pub fn record_change(&mut self, change: SyncChange) -> SyncResult<bool> {
        if let Some(tombstone) = change.tombstone() {
            let existing = self.store.tombstones()?;
            let merged = merge_tombstones(&existing, std::slice::from_ref(&tombstone));
            if merged != existing {
                self.store.save_tombstones(merged)?;
            }
        }
        self.pending.push_back(change);
        Ok(self.flush_pending())
    }

    /// Handles one decrypted message from the peer.
    pub async fn handle_message(&mut self, raw: &str) -> SyncResult<()> {
        let message = match SyncMessage::from_json(raw) {
            Ok(message) => message,
            Err(err) => {
                self.monitor.record(|stats| stats.messages_rejected += 1);
                if let Some(timestamp) = SyncMessage::undecodable_update_timestamp(raw) {
                    self.send_ack(timestamp);
                }
                return Err(SyncError::MalformedRemotePayload(err.to_string()));
            }
        };

        tracing::trace!(kind = message.kind(), "message received");
        match message {
            SyncMessage::Hello(hello) => {
                self.check_hello(&hello);
                Ok(())
            }
            SyncMessage::FullSyncRequest(request) => self.answer_full_sync(request).await,
            SyncMessage::FullSyncResponse(response) => self.apply_full_sync(response).await,
            SyncMessage::IncrementalUpdate(update) => self.apply_update(update),
            SyncMessage::ConflictResolution(message) => {
                let resolutions: Vec<ResolvedConflict> =
                    message.resolutions.iter().map(ResolvedConflict::flipped).collect();
                self.apply_resolutions(&resolutions).map(|_| ())
            }
            SyncMessage::Ack(ack) => {
                self.acknowledge(&ack);
                Ok(())
            }
        }
    }

    /// Asks the resolver about pending conflicts, applies the answers and
    /// sends them to the peer.
    pub async fn resolve_pending(&mut self) -> SyncResult<()> {
        let Some(resolver) = self.resolver.clone() else {
            return Ok(());
        };
        if self.pending_conflicts.is_empty() {
            return Ok(());
        }

        self.monitor.set_state(SyncState::Resolving);
        let resolutions = resolver.resolve(self.pending_conflicts.clone()).await;
        let applied = self.apply_resolutions(&resolutions)?;
        if applied.is_empty() {
            return Ok(());
        }

        self.unsent_resolutions.extend(applied);
        self.flush_resolutions();
        Ok(())
    }

    /// Applies decisions given from the local perspective.
    ///
    /// Decisions without a matching pending conflict are ignored. Returns
    /// the decisions that were applied.
    pub fn apply_resolutions(
        &mut self,
        resolutions: &[ResolvedConflict],
    ) -> SyncResult<Vec<ResolvedConflict>> {
        let before = snapshot(&*self.store)?;
        let mut next = before.clone();
        let mut applied = Vec::new();

        for resolution in resolutions {
            let Some(index) = self
                .pending_conflicts
                .iter()
                .position(|conflict| conflict.matches(resolution))
            else {
                tracing::debug!(item = %resolution.item_id, "no pending conflict for resolution");
                continue;
            };
            let conflict = self.pending_conflicts.remove(index);
            apply_resolution(&mut next, &conflict, resolution.resolution)?;
            applied.push(resolution.clone());
        }

        write_changes(&*self.store, &before, &next)?;
        let count = applied.len() as u64;
        self.monitor.record(|stats| stats.conflicts_resolved += count);
        if self.pending_conflicts.is_empty() && self.monitor.state() == SyncState::Resolving {
            self.monitor.set_state(SyncState::Live);
        }
        Ok(applied)
    }

    async fn answer_full_sync(&mut self, request: FullSyncRequest) -> SyncResult<()> {
        let now = self.clock.now_millis();
        let local = snapshot(&*self.store)?;
        if request.data.is_none() {
            tracing::warn!("full sync request carried no usable data, merging local only");
            self.monitor.record(|stats| stats.messages_rejected += 1);
        }

        let mut outcome = merge_payloads(&local, request.data.as_ref(), self.config.conflict_window_ms());
        prune_tombstones(
            &mut outcome.payload.tombstones,
            now,
            self.config.tombstone_retention_ms(),
        );
        write_changes(&*self.store, &local, &outcome.payload)?;

        let conflicts = outcome.conflicts;
        let awaiting = self.resolver.is_some() && !conflicts.is_empty();
        self.note_conflicts(conflicts.clone());

        let response =
            SyncMessage::full_sync_response(now, outcome.payload, conflicts, awaiting);
        if !self.sink.send_message(&response) {
            tracing::warn!("full sync response could not be sent");
        }
        self.complete_full_sync()?;

        if awaiting {
            self.resolve_pending().await?;
        }
        Ok(())
    }

    async fn apply_full_sync(&mut self, response: FullSyncResponse) -> SyncResult<()> {
        let local = snapshot(&*self.store)?;
        match response.data {
            Some(mut merged) => {
                // The merge carries the responder's `muted`; ours never syncs.
                merged.settings = local.settings.adopt(&merged.settings);
                // Changes sent after the request are not in the merge yet.
                let unacked: Vec<SyncChange> = self
                    .in_flight
                    .values()
                    .flatten()
                    .chain(self.pending.iter())
                    .cloned()
                    .collect();
                let next = match apply_changes(&merged, &unacked) {
                    Ok(applied) => applied.payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "local changes do not apply on merged data");
                        merged
                    }
                };
                write_changes(&*self.store, &local, &next)?;
            }
            None => {
                tracing::warn!("full sync response carried no usable data, keeping local data");
                self.monitor.record(|stats| stats.messages_rejected += 1);
            }
        }

        self.note_conflicts(
            response
                .conflicts
                .iter()
                .map(SyncConflict::swap_perspective)
                .collect(),
        );
        self.complete_full_sync()?;

        if !response.awaiting_resolution {
            self.resolve_pending().await?;
        }
        Ok(())
    }

    fn note_conflicts(&mut self, conflicts: Vec<SyncConflict>) {
        if !conflicts.is_empty() {
            tracing::info!(count = conflicts.len(), "conflicts detected");
        }
        let count = conflicts.len() as u64;
        self.monitor.record(|stats| stats.conflicts_detected += count);
        self.pending_conflicts = conflicts;
    }

    fn complete_full_sync(&mut self) -> SyncResult<()> {
        let now = self.clock.now_millis();
        self.config_store
            .update(&mut |config| config.last_sync_at = Some(now))?;
        self.monitor.record(|stats| {
            stats.full_syncs += 1;
            stats.last_sync_at = Some(now);
        });
        self.monitor.set_state(if self.pending_conflicts.is_empty() {
            SyncState::Live
        } else {
            SyncState::Resolving
        });
        tracing::info!(conflicts = self.pending_conflicts.len(), "full sync complete");
        Ok(())
    }

    fn apply_update(&mut self, update: IncrementalUpdate) -> SyncResult<()> {
        let local = snapshot(&*self.store)?;
        let result = apply_changes(&local, &update.changes);
        self.send_ack(update.timestamp);

        match result {
            Ok(applied) => {
                if !applied.is_noop() {
                    write_changes(&*self.store, &local, &applied.payload)?;
                }
                let count = update.changes.len() as u64;
                self.monitor.record(|stats| stats.changes_received += count);
                tracing::debug!(
                    batch = update.timestamp,
                    changes = count,
                    changed = applied.changed.len(),
                    "incremental update applied"
                );
                Ok(())
            }
            Err(err) => {
                self.monitor.record(|stats| stats.messages_rejected += 1);
                Err(SyncError::MalformedRemotePayload(err.to_string()))
            }
        }
    }

    fn check_hello(&self, hello: &Hello) {
        if let Some(expected) = &self.expected_peer {
            if &hello.device_id != expected {
                tracing::warn!(
                    expected = %expected,
                    actual = %hello.device_id,
                    "peer introduced itself with an unexpected device id"
                );
            }
        }
        if hello.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                local = PROTOCOL_VERSION,
                remote = hello.protocol_version,
                "peer speaks a different protocol version"
            );
        }
    }

    fn acknowledge(&mut self, ack: &Ack) {
        match self.in_flight.remove(&ack.for_timestamp) {
            Some(changes) => {
                tracing::trace!(batch = ack.for_timestamp, changes = changes.len(), "batch acknowledged");
            }
            None => tracing::debug!(batch = ack.for_timestamp, "ack for unknown batch"),
        }
    }

    fn send_ack(&self, for_timestamp: i64) {
        let ack = SyncMessage::ack(self.clock.now_millis(), for_timestamp);
        if !self.sink.send_message(&ack) {
            tracing::debug!(batch = for_timestamp, "ack could not be sent");
        }
    }

    fn next_batch_timestamp(&mut self) -> i64 {
        let timestamp = self.clock.now_millis().max(self.last_batch_ts + 1);
        self.last_batch_ts = timestamp;
        timestamp
    }

    /// Sends every queued change as one batch.
    fn flush_pending(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let changes: Vec<SyncChange> = self.pending.drain(..).collect();
        let timestamp = self.next_batch_timestamp();
        let message = SyncMessage::incremental_update(timestamp, changes.clone());
        if self.sink.send_message(&message) {
            let count = changes.len() as u64;
            tracing::debug!(batch = timestamp, changes = count, "incremental update sent");
            self.monitor.record(|stats| stats.changes_sent += count);
            self.in_flight.insert(timestamp, changes);
            true
        } else {
            self.pending = changes.into();
            tracing::debug!(queued = self.pending.len(), "channel closed, changes queued");
            false
        }
    }

    fn flush_resolutions(&mut self) {
        if self.unsent_resolutions.is_empty() {
            return;
        }
        let message = SyncMessage::conflict_resolution(self.unsent_resolutions.clone());
        if self.sink.send_message(&message) {
            tracing::debug!(count = self.unsent_resolutions.len(), "conflict resolutions sent");
            self.unsent_resolutions.clear();
        } else {
            tracing::debug!("channel closed, conflict resolutions kept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::sync_config::{MemoryConfigStore, SyncConfig};
    use duosync_crypto::EncryptionKey;
    use duosync_protocol::{Resolution, Settings, SyncPayload, Target, Todo};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        connected: AtomicBool,
        role: Role,
        sent: Mutex<Vec<SyncMessage>>,
    }

    impl RecordingSink {
        fn new(role: Role) -> Self {
            Self {
                connected: AtomicBool::new(true),
                role,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn take(&self) -> Vec<SyncMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl MessageSink for RecordingSink {
        fn send_message(&self, message: &SyncMessage) -> bool {
            if !self.connected.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(message.clone());
            true
        }

        fn role(&self) -> Option<Role> {
            Some(self.role)
        }
    }

    type TestEngine = SyncEngine<MemoryStore, RecordingSink>;

    struct Device {
        engine: TestEngine,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        config: Arc<MemoryConfigStore>,
    }

    fn device(id: &str, peer: &str, role: Role, todos: Vec<Todo>) -> Device {
        let mut config = SyncConfig::new(id);
        config.pair(peer, EncryptionKey::generate());
        let config = Arc::new(MemoryConfigStore::new(config));
        let store = Arc::new(MemoryStore::with_payload(SyncPayload {
            todos,
            ..SyncPayload::default()
        }));
        let sink = Arc::new(RecordingSink::new(role));
        let engine = SyncEngine::new(store.clone(), sink.clone(), config.clone())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(10_000)));
        Device {
            engine,
            store,
            sink,
            config,
        }
    }

    fn pair(a_todos: Vec<Todo>, b_todos: Vec<Todo>) -> (Device, Device) {
        (
            device("dev-a", "dev-b", Role::Dialer, a_todos),
            device("dev-b", "dev-a", Role::Listener, b_todos),
        )
    }

    async fn deliver(from: &Device, to: &mut Device) -> usize {
        let messages = from.sink.take();
        for message in &messages {
            let _ = to.engine.handle_message(&message.to_json().unwrap()).await;
        }
        messages.len()
    }

    async fn settle(a: &mut Device, b: &mut Device) {
        loop {
            let sent = deliver(a, b).await + deliver(b, a).await;
            if sent == 0 {
                break;
            }
        }
    }

    async fn connect(a: &mut Device, b: &mut Device) {
        a.sink.set_connected(true);
        b.sink.set_connected(true);
        b.engine.on_connected().await.unwrap();
        a.engine.on_connected().await.unwrap();
        settle(a, b).await;
    }

    fn set_settings(device: &Device, muted: bool, theme: &str, updated_at: i64) {
        let settings = Settings {
            updated_at,
            muted,
            ..Settings::default()
        }
        .with_value("theme", theme);
        device.store.save_settings(settings).unwrap();
    }

    fn contents(device: &Device) -> Vec<(String, String)> {
        let mut todos: Vec<(String, String)> = device
            .store
            .todos()
            .unwrap()
            .into_iter()
            .map(|t| (t.id, t.content))
            .collect();
        todos.sort();
        todos
    }

    #[tokio::test]
    async fn full_sync_converges() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t2", "Walk dog", 2000)],
        );
        connect(&mut a, &mut b).await;

        assert_eq!(contents(&a), contents(&b));
        assert_eq!(contents(&a).len(), 2);
        assert_eq!(a.engine.state(), SyncState::Live);
        assert_eq!(b.engine.state(), SyncState::Live);
        assert_eq!(a.engine.stats().full_syncs, 1);
        assert_eq!(b.engine.stats().full_syncs, 1);
        assert_eq!(a.config.load().unwrap().last_sync_at, Some(10_000));
        assert_eq!(b.config.load().unwrap().last_sync_at, Some(10_000));
    }

    #[tokio::test]
    async fn newer_edit_wins_without_conflict() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy bread", 9000)],
        );
        connect(&mut a, &mut b).await;

        assert_eq!(contents(&a), vec![("t1".into(), "Buy bread".into())]);
        assert_eq!(contents(&b), contents(&a));
        assert_eq!(a.engine.stats().conflicts_detected, 0);
    }

    #[tokio::test]
    async fn responder_resolves_and_peer_follows() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy bread", 3000)],
        );
        b.engine = b
            .engine
            .with_resolver(Arc::new(PolicyResolver(ConflictPolicy::KeepLocal)));
        connect(&mut a, &mut b).await;

        assert_eq!(contents(&b), vec![("t1".into(), "Buy bread".into())]);
        assert_eq!(contents(&a), contents(&b));
        assert!(a.engine.pending_conflicts().is_empty());
        assert!(b.engine.pending_conflicts().is_empty());
        assert_eq!(a.engine.state(), SyncState::Live);
        assert_eq!(a.engine.stats().conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn requester_resolves_when_responder_cannot() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy bread", 3000)],
        );
        a.engine = a
            .engine
            .with_resolver(Arc::new(PolicyResolver(ConflictPolicy::KeepLocal)));
        connect(&mut a, &mut b).await;

        assert_eq!(contents(&a), vec![("t1".into(), "Buy milk".into())]);
        assert_eq!(contents(&b), contents(&a));
        assert!(b.engine.pending_conflicts().is_empty());
    }

    #[tokio::test]
    async fn conflicts_stay_pending_without_resolver() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy bread", 3000)],
        );
        connect(&mut a, &mut b).await;

        assert_eq!(a.engine.state(), SyncState::Resolving);
        assert_eq!(b.engine.state(), SyncState::Resolving);
        let conflict = &a.engine.pending_conflicts()[0];
        assert_eq!(conflict.local_version["content"], "Buy milk");
        assert_eq!(conflict.remote_version["content"], "Buy bread");

        let decision = conflict.resolve(Resolution::Local);
        a.engine.apply_resolutions(&[decision]).unwrap();
        assert_eq!(contents(&a), vec![("t1".into(), "Buy milk".into())]);
        assert_eq!(a.engine.state(), SyncState::Live);
    }

    #[tokio::test]
    async fn offline_delete_flushes_as_one_batch() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy milk", 1000)],
        );
        connect(&mut a, &mut b).await;
        a.sink.set_connected(false);
        b.sink.set_connected(false);
        a.engine.on_disconnected();
        b.engine.on_disconnected();

        a.store.remove_todo("t1");
        assert!(!a.engine.record_change(SyncChange::delete_todo("t1", 20_000)).unwrap());
        assert_eq!(a.engine.pending_changes(), 1);
        assert_eq!(a.store.tombstones().unwrap().len(), 1);

        a.sink.set_connected(true);
        b.sink.set_connected(true);
        a.engine.on_connected().await.unwrap();
        let sent = a.sink.take();
        let updates: Vec<_> = sent
            .iter()
            .filter(|m| matches!(m, SyncMessage::IncrementalUpdate(_)))
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(a.engine.pending_changes(), 0);
        assert_eq!(a.engine.in_flight_batches(), 1);

        for message in &sent {
            b.engine.handle_message(&message.to_json().unwrap()).await.unwrap();
        }
        settle(&mut a, &mut b).await;
        assert!(b.store.todos().unwrap().is_empty());
        assert!(a.store.todos().unwrap().is_empty());
        assert_eq!(a.engine.in_flight_batches(), 0);
    }

    #[tokio::test]
    async fn unacknowledged_batches_are_requeued() {
        let (mut a, mut b) = pair(vec![], vec![]);
        connect(&mut a, &mut b).await;

        let todo = Todo::new("t1", "Buy milk", 11_000);
        a.store.put_todo(todo.clone());
        assert!(a.engine.record_change(SyncChange::add_todo(&todo).unwrap()).unwrap());
        assert_eq!(a.engine.in_flight_batches(), 1);

        a.engine.on_disconnected();
        assert_eq!(a.engine.in_flight_batches(), 0);
        assert_eq!(a.engine.pending_changes(), 1);
        assert_eq!(a.engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn batch_timestamps_increase_with_frozen_clock() {
        let (mut a, _b) = pair(vec![], vec![]);
        for id in ["t1", "t2", "t3"] {
            a.engine
                .record_change(SyncChange::delete_todo(id, 1))
                .unwrap();
        }
        let stamps: Vec<i64> = a
            .sink
            .take()
            .into_iter()
            .filter_map(|m| match m {
                SyncMessage::IncrementalUpdate(update) => Some(update.timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![10_000, 10_001, 10_002]);
    }

    #[tokio::test]
    async fn malformed_update_is_rejected_but_acknowledged() {
        let (_a, mut b) = pair(vec![], vec![Todo::new("t1", "Buy milk", 1000)]);

        let raw = json!({
            "type": "incremental-update",
            "timestamp": 77,
            "changes": [
                {"target": "todos", "action": "delete", "timestamp": 5, "itemId": "t1"},
                {"target": "todos", "action": "update", "timestamp": 5, "data": {"content": 3}}
            ]
        })
        .to_string();

        let err = b.engine.handle_message(&raw).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedRemotePayload(_)));
        assert_eq!(b.store.todos().unwrap().len(), 1);
        assert_eq!(b.engine.stats().messages_rejected, 1);
        assert_eq!(b.sink.take(), vec![SyncMessage::ack(10_000, 77)]);
    }

    #[tokio::test]
    async fn undecodable_update_is_acknowledged() {
        let (_a, mut b) = pair(vec![], vec![]);
        let raw = json!({"type": "incremental-update", "timestamp": 9, "changes": "nope"}).to_string();

        assert!(b.engine.handle_message(&raw).await.is_err());
        assert_eq!(b.sink.take(), vec![SyncMessage::ack(10_000, 9)]);
    }

    #[tokio::test]
    async fn malformed_request_merges_local_only() {
        let (_a, mut b) = pair(vec![], vec![Todo::new("t1", "Buy milk", 1000)]);
        let raw = json!({"type": "full-sync-request", "timestamp": 1, "data": {"todos": 5}}).to_string();

        b.engine.handle_message(&raw).await.unwrap();
        let sent = b.sink.take();
        match &sent[0] {
            SyncMessage::FullSyncResponse(response) => {
                let data = response.data.as_ref().unwrap();
                assert_eq!(data.todos.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(b.store.todos().unwrap().len(), 1);
        assert_eq!(b.engine.stats().messages_rejected, 1);
    }

    #[tokio::test]
    async fn unsent_resolution_is_flushed_on_reconnect() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy bread", 3000)],
        );
        a.engine = a
            .engine
            .with_resolver(Arc::new(PolicyResolver(ConflictPolicy::KeepLocal)));

        a.engine.on_connected().await.unwrap();
        deliver(&a, &mut b).await;
        a.sink.set_connected(false);
        deliver(&b, &mut a).await;
        assert!(a.engine.pending_conflicts().is_empty());

        a.sink.set_connected(true);
        a.engine.on_connected().await.unwrap();
        let sent = a.sink.take();
        assert!(matches!(sent[1], SyncMessage::ConflictResolution(_)));
        for message in &sent[..2] {
            b.engine.handle_message(&message.to_json().unwrap()).await.unwrap();
        }
        assert_eq!(contents(&b), vec![("t1".into(), "Buy milk".into())]);
    }

    #[tokio::test]
    async fn deleted_todo_does_not_resurrect() {
        let (mut a, mut b) = pair(
            vec![Todo::new("t1", "Buy milk", 1000)],
            vec![Todo::new("t1", "Buy milk", 1000)],
        );
        a.sink.set_connected(false);
        b.sink.set_connected(false);

        b.store.remove_todo("t1");
        b.engine
            .record_change(SyncChange::delete_todo("t1", 5000))
            .unwrap();

        // Fresh start: queued changes are dropped and a full sync follows.
        b.engine = SyncEngine::new(b.store.clone(), b.sink.clone(), b.config.clone())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(10_000)));
        connect(&mut a, &mut b).await;

        assert!(a.store.todos().unwrap().is_empty());
        assert!(b.store.todos().unwrap().is_empty());
        assert_eq!(a.store.tombstones().unwrap()[0].target, Target::Todos);
    }

    #[tokio::test]
    async fn changes_recorded_during_full_sync_survive_response() {
        let (mut a, mut b) = pair(vec![], vec![Todo::new("t2", "Walk dog", 2000)]);
        b.engine.on_connected().await.unwrap();
        a.engine.on_connected().await.unwrap();

        let todo = Todo::new("t1", "Buy milk", 10_000);
        a.store.put_todo(todo.clone());
        a.engine
            .record_change(SyncChange::add_todo(&todo).unwrap())
            .unwrap();

        // Deliver the request first, then the response back, before the update.
        let sent = a.sink.take();
        let (request, rest): (Vec<_>, Vec<_>) = sent
            .into_iter()
            .partition(|m| matches!(m, SyncMessage::FullSyncRequest(_)));
        for message in &request {
            b.engine.handle_message(&message.to_json().unwrap()).await.unwrap();
        }
        deliver(&b, &mut a).await;
        assert_eq!(contents(&a).len(), 2);

        for message in &rest {
            let _ = b.engine.handle_message(&message.to_json().unwrap()).await;
        }
        settle(&mut a, &mut b).await;
        assert_eq!(contents(&a), contents(&b));
    }

    #[tokio::test]
    async fn full_sync_keeps_each_devices_muted_flag() {
        let (mut a, mut b) = pair(vec![], vec![]);
        set_settings(&a, true, "light", 1000);
        set_settings(&b, false, "dark", 9000);
        connect(&mut a, &mut b).await;

        let (ours, theirs) = (a.store.settings().unwrap(), b.store.settings().unwrap());
        assert!(ours.muted);
        assert!(!theirs.muted);
        assert_eq!(ours.values["theme"], "dark");
        assert_eq!(theirs.values["theme"], "dark");
    }

    #[tokio::test]
    async fn full_sync_keeps_responder_muted_flag() {
        let (mut a, mut b) = pair(vec![], vec![]);
        set_settings(&a, false, "dark", 9000);
        set_settings(&b, true, "light", 1000);
        connect(&mut a, &mut b).await;

        let (ours, theirs) = (a.store.settings().unwrap(), b.store.settings().unwrap());
        assert!(!ours.muted);
        assert!(theirs.muted);
        assert_eq!(theirs.values["theme"], "dark");
    }

    #[tokio::test]
    async fn settings_update_keeps_receiver_muted_flag() {
        let (mut a, mut b) = pair(vec![], vec![]);
        set_settings(&a, false, "light", 1000);
        set_settings(&b, true, "light", 1000);
        connect(&mut a, &mut b).await;

        // A muted edit from a reaches b, which stays muted as it was.
        set_settings(&a, true, "dark", 20_000);
        let change = SyncChange::update_settings(&a.store.settings().unwrap()).unwrap();
        a.engine.record_change(change).unwrap();
        settle(&mut a, &mut b).await;
        let theirs = b.store.settings().unwrap();
        assert!(theirs.muted);
        assert_eq!(theirs.values["theme"], "dark");

        // An unmuted edit from b leaves a muted.
        set_settings(&b, true, "sepia", 30_000);
        let mut outgoing = b.store.settings().unwrap();
        outgoing.muted = false;
        b.engine
            .record_change(SyncChange::update_settings(&outgoing).unwrap())
            .unwrap();
        settle(&mut a, &mut b).await;
        let ours = a.store.settings().unwrap();
        assert!(ours.muted);
        assert_eq!(ours.values["theme"], "sepia");
    }
}

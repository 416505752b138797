//! Runs a [`SyncEngine`] on its own task.
//!
//! Connection events and local commands are handled one at a time, so
//! merges and incremental applies never interleave.

use crate::connection::ConnectionEvent;
use crate::engine::{EngineMonitor, MessageSink, SyncEngine, SyncState, SyncStats};
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use duosync_protocol::SyncChange;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `shutdown` waits for the task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A command for the engine task.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// The application changed its store.
    LocalChange(SyncChange),
    /// Start a full sync now.
    Resync,
    /// Stop the task.
    Shutdown,
}

/// Handle to a running engine task.
#[derive(Debug)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    monitor: Arc<EngineMonitor>,
    task: JoinHandle<()>,
}

/// Spawns `engine` on a tokio task fed by `events`.
pub fn spawn_engine<S, K>(
    mut engine: SyncEngine<S, K>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> EngineHandle
where
    S: LocalStore + 'static,
    K: MessageSink,
{
    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let monitor = engine.monitor();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                command = command_rx.recv() => match command {
                    Some(EngineCommand::LocalChange(change)) => match engine.record_change(change) {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(queued = engine.pending_changes(), "change queued"),
                        Err(err) => tracing::warn!(error = %err, "failed to record change"),
                    },
                    Some(EngineCommand::Resync) => {
                        if let Err(err) = engine.request_full_sync() {
                            tracing::debug!(error = %err, "resync not sent");
                        }
                    }
                    Some(EngineCommand::Shutdown) | None => break,
                },

                event = events.recv() => match event {
                    Some(event) => engine.handle_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("sync engine task stopped");
    });

    EngineHandle {
        commands,
        monitor,
        task,
    }
}

impl EngineHandle {
    /// Queues a local change.
    pub fn record_change(&self, change: SyncChange) -> SyncResult<()> {
        self.send(EngineCommand::LocalChange(change))
    }

    /// Requests a full sync.
    pub fn resync(&self) -> SyncResult<()> {
        self.send(EngineCommand::Resync)
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.monitor.state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.monitor.stats()
    }

    /// Shared view of state and stats.
    pub fn monitor(&self) -> Arc<EngineMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Returns true while the task runs.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the task, aborting it if it does not stop in time.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!("sync engine did not stop in time, aborting");
            self.task.abort();
        }
    }

    fn send(&self, command: EngineCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }
}

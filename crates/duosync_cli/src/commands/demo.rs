//! Demo command implementation.
//!
//! Pairs two in-process devices over the loopback transport, edits data on
//! both and prints the converged state.

use duosync_engine::{
    Clock, ConfigStore, LoopbackNetwork, MemoryConfigStore, MemoryStore, Pairing, PolicyResolver,
    SyncConfig, SyncSession, SystemClock,
};
use duosync_protocol::{ConflictPolicy, Settings, SyncChange, SyncPayload, Todo};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_until(mut check: impl FnMut() -> bool) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    while !check() {
        if Instant::now() >= deadline {
            return Err("devices did not converge in time".into());
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn same_todos(a: &MemoryStore, b: &MemoryStore) -> bool {
    let sorted = |store: &MemoryStore| {
        let mut todos = store.contents().todos;
        todos.sort_by(|x, y| x.id.cmp(&y.id));
        todos
    };
    sorted(a) == sorted(b)
}

/// Runs the demo.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let clock = SystemClock;
    let network = LoopbackNetwork::new();
    let config_a = Arc::new(MemoryConfigStore::new(SyncConfig::fresh()));
    let config_b = Arc::new(MemoryConfigStore::new(SyncConfig::fresh()));

    println!("== Pairing");
    let initiator = Pairing::new(Arc::new(network.transport()), config_a.clone());
    let responder = Pairing::new(Arc::new(network.transport()), config_b.clone());
    let offer = initiator.offer()?;
    println!("  payload: {}", offer.payload.to_json()?);
    println!("  PIN:     {}", offer.pin);
    let raw = offer.payload.to_json()?;
    let (a, b) = tokio::join!(initiator.await_responder(&offer), responder.respond(&raw));
    println!("  device A paired with {}", a?);
    println!("  device B paired with {}", b?);

    let now = clock.now_millis();
    let store_a = Arc::new(MemoryStore::with_payload(SyncPayload::new(
        vec![
            Todo::new("t1", "Buy milk", now),
            Todo::new("t2", "Write report", now),
        ],
        vec![],
        Settings::default(),
    )));
    let store_b = Arc::new(MemoryStore::with_payload(SyncPayload::new(
        vec![Todo::new("t3", "Walk dog", now)],
        vec![],
        Settings::default().with_value("theme", "dark"),
    )));

    println!("== Full sync");
    let (session_a, session_b) = tokio::join!(
        SyncSession::builder(Arc::new(network.transport()), store_a.clone(), config_a.clone())
            .with_resolver(Arc::new(PolicyResolver(ConflictPolicy::LastWriteWins)))
            .start(),
        SyncSession::builder(Arc::new(network.transport()), store_b.clone(), config_b.clone())
            .with_resolver(Arc::new(PolicyResolver(ConflictPolicy::LastWriteWins)))
            .start(),
    );
    let (session_a, session_b) = (session_a?, session_b?);
    wait_until(|| store_a.contents().todos.len() == 3 && same_todos(&store_a, &store_b)).await?;
    println!("  both devices hold {} todos", store_a.contents().todos.len());

    println!("== Incremental updates");
    let mut done = store_a
        .contents()
        .todo("t1")
        .cloned()
        .ok_or("todo t1 missing")?;
    done.done = true;
    done.updated_at = clock.now_millis() + 1;
    store_a.put_todo(done.clone());
    session_a.record_change(SyncChange::update_todo(&done)?)?;

    store_b.remove_todo("t2");
    session_b.record_change(SyncChange::delete_todo("t2", clock.now_millis() + 1))?;

    wait_until(|| {
        store_a.contents().todos.len() == 2
            && store_b.contents().todo("t1").is_some_and(|t| t.done)
            && same_todos(&store_a, &store_b)
    })
    .await?;

    println!("== Converged state");
    println!("{}", serde_json::to_string_pretty(&store_a.contents())?);
    for (name, session, config) in [("A", &session_a, &config_a), ("B", &session_b, &config_b)] {
        let stats = session.stats();
        println!(
            "  device {name} ({}): full syncs {}, sent {}, received {}, last sync {:?}",
            session.device_id(),
            stats.full_syncs,
            stats.changes_sent,
            stats.changes_received,
            config.load()?.last_sync_at,
        );
    }

    session_a.shutdown().await;
    session_b.shutdown().await;
    Ok(())
}

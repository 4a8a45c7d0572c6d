#![allow(dead_code)]

use agentflow::providers::Provider;
use agentflow::providers::in_memory::InMemoryProvider;
use agentflow::providers::sqlite::SqliteProvider;
use agentflow::runtime::{Runtime, RuntimeOptions};
use agentflow::{ActivityRegistry, Event, OrchestrationRegistry, OrchestrationStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        ..RuntimeOptions::default()
    }
}

pub fn in_memory_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::default())
}

pub async fn start_runtime(
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, Arc::new(activities), orchestrations, fast_options()).await
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url).await.unwrap()) as Arc<dyn Provider>;
    (store, td, db_url)
}

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read_history(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Output of a completed instance, parsed as JSON.
pub fn completed_json(status: OrchestrationStatus) -> serde_json::Value {
    match status {
        OrchestrationStatus::Completed { output } => serde_json::from_str(&output).unwrap(),
        other => panic!("expected Completed, got {other:?}"),
    }
}

/// Event ids must run 1..=n without gaps.
pub fn assert_contiguous(history: &[Event]) {
    for (idx, event) in history.iter().enumerate() {
        assert_eq!(event.event_id, idx as u64 + 1, "gap in history: {history:?}");
    }
}

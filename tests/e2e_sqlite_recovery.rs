use std::sync::Arc;
use std::time::Duration;

use agentflow::agents::{self, TEMPLATE_ORCHESTRATOR};
use agentflow::config::WorkflowOptions;
use agentflow::providers::Provider;
use agentflow::providers::sqlite::SqliteProvider;
use agentflow::runtime::{Runtime, RuntimeOptions};
use agentflow::{ActivityContext, ActivityRegistry, EventKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};
use serde_json::json;

mod common;

#[tokio::test]
async fn instance_started_before_any_runtime_completes_after_reopen() {
    let (store, _td, db_url) = common::create_sqlite_store_disk().await;
    let client = agentflow::Client::new(store.clone());
    let id = client
        .start_orchestration_typed(TEMPLATE_ORCHESTRATOR, &json!({"arg1": "x", "arg2": "y"}))
        .await
        .unwrap();
    drop(client);
    drop(store);

    let reopened = Arc::new(SqliteProvider::new(&db_url).await.unwrap()) as Arc<dyn Provider>;
    let rt = common::start_runtime(
        reopened.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(reopened);
    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        common::completed_json(status),
        json!({"agent_2": "y", "previous": {"agent_1": "x"}})
    );
    common::assert_contiguous(&client.read_history(&id).await.unwrap());
    rt.shutdown().await;
}

fn pipeline(activities: ActivityRegistry) -> (Arc<ActivityRegistry>, OrchestrationRegistry) {
    let orchestrations = OrchestrationRegistry::builder()
        .register("two_steps", |ctx: OrchestrationContext, input: String| async move {
            let first = ctx.schedule_activity("step", format!("{input}-1")).await?;
            ctx.schedule_activity("step", format!("{first}-2")).await
        })
        .build();
    (Arc::new(activities), orchestrations)
}

#[tokio::test]
async fn work_abandoned_by_a_crashed_worker_is_redelivered() {
    let (store, _td, db_url) = common::create_sqlite_store_disk().await;

    // The first runtime hangs inside the activity and never acks it
    let hanging = ActivityRegistry::builder()
        .register("step", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        })
        .build();
    let (acts, orchs) = pipeline(hanging);
    let options = RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        worker_lock_timeout: Duration::from_millis(200),
        ..RuntimeOptions::default()
    };
    let crashed = Runtime::start_with_options(store.clone(), acts, orchs, options).await;
    let client = agentflow::Client::new(store.clone());
    let id = client.start_orchestration("two_steps", "doc").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            &id,
            |h| h.iter().any(|e| matches!(e.kind, EventKind::ActivityScheduled { .. })),
            5_000
        )
        .await
    );
    crashed.shutdown().await;

    let reopened = Arc::new(SqliteProvider::new(&db_url).await.unwrap()) as Arc<dyn Provider>;
    let working = ActivityRegistry::builder()
        .register("step", |ctx: ActivityContext, input: String| async move {
            Ok(format!("{input}@{}", ctx.scheduled_event_id()))
        })
        .build();
    let (acts, orchs) = pipeline(working);
    let rt = Runtime::start_with_options(reopened.clone(), acts, orchs, common::fast_options()).await;
    let client = agentflow::Client::new(reopened);

    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "doc-1@2-2@4".into()
        }
    );
    rt.shutdown().await;
}

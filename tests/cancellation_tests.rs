use std::time::Duration;

use agentflow::{ActivityContext, ActivityRegistry, EventKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};

mod common;

fn blocking_registries() -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("block", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("parent", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_sub_orchestration("child", input).await
        })
        .register("child", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("block", input).await
        })
        .build();
    (activities, orchestrations)
}

#[tokio::test]
async fn terminating_a_parent_terminates_its_running_child() {
    let store = common::in_memory_store();
    let (activities, orchestrations) = blocking_registries();
    let rt = common::start_runtime(store.clone(), activities, orchestrations).await;
    let client = agentflow::Client::new(store.clone());

    let id = client.start_orchestration("parent", "x").await.unwrap();
    let child = agentflow::sub_orchestration_instance_id(&id, 2);
    assert!(
        common::wait_for_history(
            store.clone(),
            &child,
            |h| h.iter().any(|e| matches!(e.kind, EventKind::ActivityScheduled { .. })),
            5_000
        )
        .await
    );

    client.terminate_instance(&id, "operator request").await.unwrap();
    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Terminated {
            reason: "operator request".into()
        }
    );

    match client.wait_for_orchestration(&child, common::WAIT).await.unwrap() {
        OrchestrationStatus::Terminated { reason } => {
            assert!(reason.contains(&format!("parent instance {id} terminated")));
        }
        other => panic!("child should be terminated, got {other:?}"),
    }

    let history = client.read_history(&id).await.unwrap();
    common::assert_contiguous(&history);
    assert!(history.last().unwrap().is_terminal());
    rt.shutdown().await;
}

#[tokio::test]
async fn terminating_a_finished_instance_changes_nothing() {
    let store = common::in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("quick", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = common::start_runtime(store.clone(), ActivityRegistry::default(), orchestrations).await;
    let client = agentflow::Client::new(store);

    let id = client.start_orchestration("quick", "done").await.unwrap();
    client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    let before = client.read_history(&id).await.unwrap();

    client.terminate_instance(&id, "too late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        client.get_status(&id).await.unwrap(),
        OrchestrationStatus::Completed { output: "done".into() }
    );
    assert_eq!(client.read_history(&id).await.unwrap(), before);
    rt.shutdown().await;
}

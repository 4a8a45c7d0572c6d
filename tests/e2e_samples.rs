use agentflow::agents::{self, AGENT_ORCHESTRATOR, REVIEW_AND_COMPLETION_LOOP, TEMPLATE_ORCHESTRATOR};
use agentflow::config::WorkflowOptions;
use agentflow::providers::InstanceStatus;
use agentflow::{
    ActivityContext, ActivityRegistry, Error, EventKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
};
use serde_json::{Value, json};

mod common;

#[tokio::test]
async fn invoice_pipeline_runs_to_completion() {
    let store = common::in_memory_store();
    let rt = common::start_runtime(
        store.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(store.clone());

    let id = client
        .start_orchestration_typed(AGENT_ORCHESTRATOR, &json!({"source": "ap@example.com"}))
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        common::completed_json(status),
        json!({"formatted_data": "formatted reviewed refined categories of text of invoice_document from ap@example.com"})
    );

    let history = client.read_history(&id).await.unwrap();
    common::assert_contiguous(&history);
    let activities: Vec<String> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        activities,
        vec![
            "email_receipt_agent",
            "ocr_extraction_agent",
            "document_analysis_agent",
            "extraction_refinement_agent",
            "final_formatting_agent"
        ]
    );

    let (child_id, child_name) = history
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::SubOrchestrationScheduled { instance, name, .. } => Some((instance.clone(), name.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(child_name, REVIEW_AND_COMPLETION_LOOP);
    assert!(child_id.starts_with(&format!("{id}::sub::")));
    let child = client.get_instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.parent_instance.as_deref(), Some(id.as_str()));

    rt.shutdown().await;
}

#[tokio::test]
async fn invoice_pipeline_accepts_null_input() {
    let store = common::in_memory_store();
    let rt = common::start_runtime(
        store.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(store);

    let id = client.start_orchestration(AGENT_ORCHESTRATOR, "null").await.unwrap();
    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        common::completed_json(status)["formatted_data"],
        "formatted reviewed refined categories of text of invoice_document from inbox"
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn template_workflow_chains_both_agents() {
    let store = common::in_memory_store();
    let rt = common::start_runtime(
        store.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(store);

    let id = client
        .start_orchestration_typed(TEMPLATE_ORCHESTRATOR, &json!({"arg1": 1, "arg2": "b"}))
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        common::completed_json(status),
        json!({"agent_2": "b", "previous": {"agent_1": 1}})
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn malformed_start_payload_fails_with_invalid_input() {
    let store = common::in_memory_store();
    let rt = common::start_runtime(
        store.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(store);

    let id = client.start_orchestration(AGENT_ORCHESTRATOR, "[1, 2]").await.unwrap();
    match client.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed { error } => assert_eq!(error.kind(), "InvalidInput"),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn string_payloads_that_look_like_json_keep_their_type() {
    let store = common::in_memory_store();
    let activities = ActivityRegistry::builder()
        .register_typed("echo", |_ctx: ActivityContext, v: Value| async move { Ok::<_, Error>(v) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("relay", |ctx: OrchestrationContext, sent: Value| async move {
            let got: Value = ctx.call_activity_typed("echo", &sent).await?;
            Ok::<_, Error>(json!({ "sent": sent, "got": got }))
        })
        .build();
    let rt = common::start_runtime(store.clone(), activities, orchestrations).await;
    let client = agentflow::Client::new(store);

    for payload in [json!("42"), json!("true"), json!("null"), json!("{\"a\":1}"), json!("plain")] {
        let id = client.start_orchestration_typed("relay", &payload).await.unwrap();
        let status = client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
        assert_eq!(
            common::completed_json(status),
            json!({ "sent": payload.clone(), "got": payload })
        );
    }
    rt.shutdown().await;
}

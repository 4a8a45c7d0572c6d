use agentflow::agents::{self, AGENT_ORCHESTRATOR, TEMPLATE_ORCHESTRATOR};
use agentflow::config::WorkflowOptions;
use agentflow::runtime::advance;
use agentflow::{Action, Event, EventKind, OrchestrationRegistry, run_turn};
use serde_json::json;

mod common;

async fn completed_history(orchestration: &str, input: serde_json::Value) -> (String, Vec<Event>) {
    let store = common::in_memory_store();
    let rt = common::start_runtime(
        store.clone(),
        agents::activities(),
        agents::orchestrations(&WorkflowOptions::default()),
    )
    .await;
    let client = agentflow::Client::new(store);
    let id = client.start_orchestration_typed(orchestration, &input).await.unwrap();
    client.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    let history = client.read_history(&id).await.unwrap();
    rt.shutdown().await;
    (id, history)
}

fn registry() -> OrchestrationRegistry {
    agents::orchestrations(&WorkflowOptions::default())
}

/// From every point where a turn began, replaying the prefix re-derives exactly the events
/// that the runtime recorded next.
fn assert_prefixes_replay(id: &str, name: &str, history: &[Event]) {
    let handler = registry().get(name).unwrap();
    for k in 1..history.len() {
        let prev = &history[k - 1].kind;
        let turn_boundary = matches!(prev, EventKind::OrchestrationStarted { .. }) || prev.is_completion();
        if !turn_boundary {
            continue;
        }
        let first = advance(handler.clone(), id, &history[..k]);
        let second = advance(handler.clone(), id, &history[..k]);
        assert_eq!(first, second, "advance is not pure at prefix {k}");
        let expected = &history[k..k + first.history_delta.len()];
        assert_eq!(first.history_delta, expected, "replay diverged at prefix {k}");
    }
}

#[tokio::test]
async fn template_history_replays_identically() {
    let (id, history) = completed_history(TEMPLATE_ORCHESTRATOR, json!({"arg1": "a", "arg2": "b"})).await;
    assert_prefixes_replay(&id, TEMPLATE_ORCHESTRATOR, &history);
}

#[tokio::test]
async fn invoice_history_replays_identically() {
    let (id, history) = completed_history(AGENT_ORCHESTRATOR, json!({"source": "inbox"})).await;
    assert_prefixes_replay(&id, AGENT_ORCHESTRATOR, &history);
    let done = advance(registry().get(AGENT_ORCHESTRATOR).unwrap(), &id, &history);
    assert!(done.result.unwrap().is_ok());
    assert!(done.history_delta.is_empty());
}

#[test]
fn at_most_one_new_schedule_per_turn() {
    let started = Event::new(
        1,
        None,
        EventKind::OrchestrationStarted {
            name: "fan".into(),
            input: String::new(),
            parent_instance: None,
            parent_id: None,
        },
    );
    let fan_out = |ctx: agentflow::OrchestrationContext| async move {
        let calls = (0..4).map(|i| ctx.schedule_activity("work", i.to_string())).collect();
        let results = ctx.join(calls).await;
        let joined: Result<Vec<String>, _> = results.into_iter().collect();
        Ok(joined?.join(","))
    };

    let mut history = vec![started];
    let mut scheduled = Vec::new();
    for turn in 0..4 {
        let out = run_turn("fan", history.clone(), fan_out);
        assert_eq!(out.actions.len(), 1, "turn {turn} scheduled more than one call");
        assert_eq!(out.deferred, turn < 3);
        let Action::CallActivity { scheduling_event_id, input, .. } = &out.actions[0] else {
            panic!("expected an activity call");
        };
        assert_eq!(input, &turn.to_string());
        scheduled.push(*scheduling_event_id);
        history = out.history;
    }
    assert_eq!(scheduled, vec![2, 3, 4, 5]);
}

#[test]
fn fan_out_completions_in_any_order_resolve_by_source_id() {
    let started = Event::new(
        1,
        None,
        EventKind::OrchestrationStarted {
            name: "fan".into(),
            input: String::new(),
            parent_instance: None,
            parent_id: None,
        },
    );
    let mut history = vec![started];
    for (id, input) in [(2u64, "a"), (3, "b"), (4, "c")] {
        history.push(Event::new(
            id,
            None,
            EventKind::ActivityScheduled {
                name: "echo".into(),
                input: input.into(),
                retry: None,
            },
        ));
    }
    // Completions land in reverse order
    history.push(Event::new(5, Some(4), EventKind::ActivityCompleted { result: "C".into() }));
    history.push(Event::new(6, Some(2), EventKind::ActivityCompleted { result: "A".into() }));
    history.push(Event::new(7, Some(3), EventKind::ActivityCompleted { result: "B".into() }));

    let out = run_turn("fan", history, |ctx| async move {
        let calls = ["a", "b", "c"].iter().map(|i| ctx.schedule_activity("echo", *i)).collect();
        let results: Result<Vec<String>, _> = ctx.join(calls).await.into_iter().collect();
        Ok(results?.join(""))
    });
    assert_eq!(out.output, Some(Ok("ABC".to_string())));
    assert!(out.actions.is_empty());
    assert!(out.nondeterminism.is_none());
}

fn a_and_b_scheduled_only_b_completed() -> Vec<Event> {
    vec![
        Event::new(
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "pair".into(),
                input: String::new(),
                parent_instance: None,
                parent_id: None,
            },
        ),
        Event::new(
            2,
            None,
            EventKind::ActivityScheduled {
                name: "A".into(),
                input: "a".into(),
                retry: None,
            },
        ),
        Event::new(
            3,
            None,
            EventKind::ActivityScheduled {
                name: "B".into(),
                input: "b".into(),
                retry: None,
            },
        ),
        Event::new(4, Some(3), EventKind::ActivityCompleted { result: "B done".into() }),
    ]
}

async fn a_then_b_then_c(ctx: agentflow::OrchestrationContext) -> Result<String, agentflow::Error> {
    let a = ctx.schedule_activity("A", "a");
    let b = ctx.schedule_activity("B", "b");
    let ra = a.await?;
    let rb = b.await?;
    ctx.schedule_activity("C", format!("{ra}+{rb}")).await
}

#[test]
fn completion_of_b_does_not_release_a_step_waiting_on_a() {
    let out = run_turn("pair", a_and_b_scheduled_only_b_completed(), a_then_b_then_c);
    assert!(out.output.is_none());
    assert!(out.actions.is_empty());
    assert!(out.nondeterminism.is_none());

    let joined = run_turn("pair", a_and_b_scheduled_only_b_completed(), |ctx| async move {
        let calls = vec![ctx.schedule_activity("A", "a"), ctx.schedule_activity("B", "b")];
        let results: Result<Vec<String>, _> = ctx.join(calls).await.into_iter().collect();
        ctx.schedule_activity("C", results?.join("+")).await
    });
    assert!(joined.output.is_none());
    assert!(joined.actions.is_empty());
    assert!(joined.nondeterminism.is_none());

    // Once A lands the definition moves on to C
    let mut history = a_and_b_scheduled_only_b_completed();
    history.push(Event::new(5, Some(2), EventKind::ActivityCompleted { result: "A done".into() }));
    let out = run_turn("pair", history, a_then_b_then_c);
    assert!(out.output.is_none());
    assert!(out.nondeterminism.is_none());
    assert_eq!(
        out.actions,
        vec![Action::CallActivity {
            scheduling_event_id: 6,
            name: "C".into(),
            input: "A done+B done".into(),
            retry: None
        }]
    );
}

#[test]
fn code_change_is_reported_as_nondeterminism() {
    let history = vec![
        Event::new(
            1,
            None,
            EventKind::OrchestrationStarted {
                name: TEMPLATE_ORCHESTRATOR.into(),
                input: "{}".into(),
                parent_instance: None,
                parent_id: None,
            },
        ),
        Event::new(
            2,
            None,
            EventKind::ActivityScheduled {
                name: "some_other_agent".into(),
                input: "{}".into(),
                retry: None,
            },
        ),
    ];
    let result = advance(registry().get(TEMPLATE_ORCHESTRATOR).unwrap(), "i", &history);
    assert_eq!(result.result.unwrap().unwrap_err().kind(), "CorruptHistory");
    assert!(result.awaiting.is_none());
}

//! # agentflow
//!
//! Durable, replay-based orchestration of multi-step agent workflows.
//!
//! An orchestration is an ordinary `async fn(OrchestrationContext, String) -> Result<String, Error>`.
//! Each time something happens to an instance (it starts, an activity completes, a child
//! orchestration finishes) the runtime re-runs the function from the top. Every
//! `schedule_*` call is answered from the recorded history when a matching event exists;
//! the first call without a recorded scheduling event becomes the new pending action.
//! Orchestration code therefore never repeats side effects, it only re-derives control flow,
//! and an instance can be resumed on any process from its persisted history alone.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentflow::providers::in_memory::InMemoryProvider;
//! use agentflow::runtime::{self, registry::ActivityRegistry};
//! use agentflow::{Client, OrchestrationContext, OrchestrationRegistry};
//!
//! # async fn demo() -> Result<(), agentflow::Error> {
//! let activities = ActivityRegistry::builder()
//!     .register("greet", |_ctx, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("hello", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.schedule_activity("greet", name).await
//!     })
//!     .build();
//!
//! let store = Arc::new(InMemoryProvider::default());
//! let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
//! let client = Client::new(store);
//! let id = client.start_orchestration("hello", "world").await?;
//! let status = client.wait_for_orchestration(&id, std::time::Duration::from_secs(5)).await;
//! # let _ = status;
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

pub mod agents;
pub mod client;
pub mod config;
pub mod error;
pub mod futures;
pub mod logging;
pub mod planner;
pub mod providers;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use error::Error;
pub use crate::futures::DurableFuture;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, OrchestrationStatus, RetryPolicy, Runtime};

use crate::_typed_codec::Codec;

// Typed payload helpers used by registries and the context
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    use crate::Error;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, Error>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, Error>;
    }

    /// Payloads are JSON text. Strings stay quoted so `"42"` never comes back as a number.
    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, Error> {
            serde_json::to_string(v).map_err(|e| Error::InvalidInput(e.to_string()))
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, Error> {
            serde_json::from_str(s).map_err(|e| Error::InvalidInput(e.to_string()))
        }
    }
}

/// Event id of the `OrchestrationStarted` event that opens every history.
pub const INITIAL_EVENT_ID: u64 = 1;

/// One append-only history record.
///
/// `event_id` is the per-instance sequence number. Completions point back at the
/// scheduling event they answer through `source_event_id`, which is how fanned-out
/// calls are matched regardless of completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<u64>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    OrchestrationStarted {
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_instance: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    ActivityCompleted {
        result: String,
    },
    ActivityFailed {
        error: Error,
    },
    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        error: Error,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        error: Error,
    },
    OrchestrationTerminated {
        reason: String,
    },
}

impl Event {
    pub fn new(event_id: u64, source_event_id: Option<u64>, kind: EventKind) -> Self {
        Self {
            event_id,
            source_event_id,
            kind,
        }
    }

    /// Completed, Failed and Terminated end an instance; nothing is appended afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
        )
    }
}

impl EventKind {
    /// Stable name, used as the `event_type` column and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::OrchestrationStarted { .. } => "OrchestrationStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed",
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated",
        }
    }

    pub fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. } | EventKind::SubOrchestrationScheduled { .. }
        )
    }

    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityCompleted { .. }
                | EventKind::ActivityFailed { .. }
                | EventKind::SubOrchestrationCompleted { .. }
                | EventKind::SubOrchestrationFailed { .. }
        )
    }
}

/// A pending action produced by a turn, to be dispatched by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

impl Action {
    pub fn scheduling_event_id(&self) -> u64 {
        match self {
            Action::CallActivity { scheduling_event_id, .. }
            | Action::StartSubOrchestration { scheduling_event_id, .. } => *scheduling_event_id,
        }
    }
}

/// Instance id given to the child started by scheduling event `event_id` of `parent`.
pub fn sub_orchestration_instance_id(parent: &str, event_id: u64) -> String {
    format!("{parent}::sub::{event_id}")
}

/// What a `DurableFuture` asks for on its first poll.
#[derive(Debug, Clone)]
pub(crate) enum ScheduleRequest {
    Activity {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    SubOrchestration {
        name: String,
        input: String,
    },
}

impl ScheduleRequest {
    fn matches(&self, recorded: &EventKind) -> bool {
        match (self, recorded) {
            (
                ScheduleRequest::Activity { name, input, .. },
                EventKind::ActivityScheduled { name: n, input: i, .. },
            ) => name == n && input == i,
            (
                ScheduleRequest::SubOrchestration { name, input },
                EventKind::SubOrchestrationScheduled { name: n, input: i, .. },
            ) => name == n && input == i,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            ScheduleRequest::Activity { name, .. } => format!("activity '{name}'"),
            ScheduleRequest::SubOrchestration { name, .. } => format!("sub-orchestration '{name}'"),
        }
    }
}

pub(crate) enum Claim {
    /// Answered by an existing scheduling event.
    Recorded(u64),
    /// Newly scheduled in this turn.
    Scheduled(u64),
    /// Another call already scheduled something this turn.
    Deferred,
    /// History disagrees with the code.
    Mismatch,
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    next_event_id: u64,
    // Ids of scheduling events in history order; claimed front to back.
    schedule_ids: Vec<u64>,
    claim_cursor: usize,
    baseline_schedules: usize,
    actions: Vec<Action>,
    scheduled_this_turn: bool,
    deferred: bool,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>) -> Self {
        let schedule_ids: Vec<u64> = history
            .iter()
            .filter(|e| e.kind.is_schedule())
            .map(|e| e.event_id)
            .collect();
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        Self {
            instance,
            baseline_schedules: schedule_ids.len(),
            history,
            next_event_id,
            schedule_ids,
            claim_cursor: 0,
            actions: Vec::new(),
            scheduled_this_turn: false,
            deferred: false,
            nondeterminism: None,
        }
    }

    fn event(&self, event_id: u64) -> Option<&Event> {
        self.history.iter().find(|e| e.event_id == event_id)
    }

    pub(crate) fn claim(&mut self, request: &ScheduleRequest) -> Claim {
        if let Some(&id) = self.schedule_ids.get(self.claim_cursor) {
            self.claim_cursor += 1;
            let matches = self.event(id).is_some_and(|e| request.matches(&e.kind));
            if matches {
                return Claim::Recorded(id);
            }
            let recorded = self.event(id).map(|e| e.kind.name()).unwrap_or("nothing");
            self.flag_nondeterminism(format!(
                "{} does not match recorded {recorded} at event {id}",
                request.describe()
            ));
            return Claim::Mismatch;
        }

        if self.scheduled_this_turn {
            self.deferred = true;
            return Claim::Deferred;
        }

        let id = self.next_event_id;
        self.next_event_id += 1;
        let (kind, action) = match request.clone() {
            ScheduleRequest::Activity { name, input, retry } => (
                EventKind::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                    retry: retry.clone(),
                },
                Action::CallActivity {
                    scheduling_event_id: id,
                    name,
                    input,
                    retry,
                },
            ),
            ScheduleRequest::SubOrchestration { name, input } => {
                let child = sub_orchestration_instance_id(&self.instance, id);
                (
                    EventKind::SubOrchestrationScheduled {
                        name: name.clone(),
                        instance: child.clone(),
                        input: input.clone(),
                    },
                    Action::StartSubOrchestration {
                        scheduling_event_id: id,
                        name,
                        instance: child,
                        input,
                    },
                )
            }
        };
        self.history.push(Event::new(id, None, kind));
        self.schedule_ids.push(id);
        self.claim_cursor += 1;
        self.actions.push(action);
        self.scheduled_this_turn = true;
        Claim::Scheduled(id)
    }

    pub(crate) fn completion_for(&self, scheduling_event_id: u64) -> Option<EventKind> {
        self.history
            .iter()
            .find(|e| e.source_event_id == Some(scheduling_event_id) && e.kind.is_completion())
            .map(|e| e.kind.clone())
    }

    pub(crate) fn flag_nondeterminism(&mut self, message: String) {
        self.nondeterminism.get_or_insert(message);
    }
}

/// Handle given to orchestration code for scheduling durable work.
///
/// Cloning is cheap; clones share the same turn state.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the code is still re-deriving scheduling calls that were recorded
    /// before this turn began.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.claim_cursor < inner.baseline_schedules
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            ScheduleRequest::Activity {
                name: name.into(),
                input: input.into(),
                retry: None,
            },
        )
    }

    /// Schedule an activity that the worker retries according to `retry`.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            ScheduleRequest::Activity {
                name: name.into(),
                input: input.into(),
                retry: Some(retry),
            },
        )
    }

    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            ScheduleRequest::SubOrchestration {
                name: name.into(),
                input: input.into(),
            },
        )
    }

    /// Typed activity call: serializes `input` and decodes the result as `Out`.
    pub async fn call_activity_typed<In, Out>(&self, name: &str, input: &In) -> Result<Out, Error>
    where
        In: Serialize + Sync,
        Out: DeserializeOwned,
    {
        let payload = _typed_codec::Json::encode(input)?;
        let result = self.schedule_activity(name, payload).await?;
        _typed_codec::Json::decode(&result)
    }

    pub async fn call_sub_orchestration_typed<In, Out>(&self, name: &str, input: &In) -> Result<Out, Error>
    where
        In: Serialize + Sync,
        Out: DeserializeOwned,
    {
        let payload = _typed_codec::Json::encode(input)?;
        let result = self.schedule_sub_orchestration(name, payload).await?;
        _typed_codec::Json::decode(&result)
    }

    /// Await several durable futures together. Results come back in argument order,
    /// whatever order the completions were recorded in.
    pub fn join(&self, futures: Vec<DurableFuture>) -> ::futures::future::JoinAll<DurableFuture> {
        ::futures::future::join_all(futures)
    }
}

/// Result of polling an orchestration once against a history.
#[derive(Debug)]
pub struct TurnOutput {
    /// Input history plus the scheduling events recorded this turn.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub output: Option<Result<String, Error>>,
    /// A second new scheduling request was held back for the next turn.
    pub deferred: bool,
    pub nondeterminism: Option<String>,
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
    fut.poll(&mut cx)
}

/// Poll `orchestrator` exactly once against `history`.
pub fn run_turn<F>(
    instance: &str,
    history: Vec<Event>,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutput
where
    F: Future<Output = Result<String, Error>>,
{
    let ctx = OrchestrationContext::new(instance, history);
    let mut fut = std::pin::pin!(orchestrator(ctx.clone()));
    let output = match poll_once(fut.as_mut()) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let mut inner = ctx.lock();
    TurnOutput {
        history: std::mem::take(&mut inner.history),
        actions: std::mem::take(&mut inner.actions),
        output,
        deferred: inner.deferred,
        nondeterminism: inner.nondeterminism.take(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(input: &str) -> Event {
        Event::new(
            INITIAL_EVENT_ID,
            None,
            EventKind::OrchestrationStarted {
                name: "o".into(),
                input: input.into(),
                parent_instance: None,
                parent_id: None,
            },
        )
    }

    #[test]
    fn codec_keeps_json_types_intact() {
        assert_eq!(_typed_codec::Json::encode(&"abc").unwrap(), r#""abc""#);
        assert_eq!(_typed_codec::Json::encode(&vec![1, 2]).unwrap(), "[1,2]");
        let s: String = _typed_codec::Json::decode(r#""abc""#).unwrap();
        assert_eq!(s, "abc");
        for text in ["42", "true", "null", r#"{"a":1}"#] {
            let encoded = _typed_codec::Json::encode(&serde_json::Value::String(text.into())).unwrap();
            let back: serde_json::Value = _typed_codec::Json::decode(&encoded).unwrap();
            assert_eq!(back, serde_json::Value::String(text.into()));
        }
        assert_eq!(_typed_codec::Json::decode::<String>("abc").unwrap_err().kind(), "InvalidInput");
        assert_eq!(_typed_codec::Json::decode::<u32>(r#""7""#).unwrap_err().kind(), "InvalidInput");
    }

    #[test]
    fn first_turn_schedules_a_single_activity() {
        let out = run_turn("i", vec![started("x")], |ctx| async move {
            let a = ctx.schedule_activity("A", "1").await?;
            Ok(a)
        });
        assert!(out.output.is_none());
        assert_eq!(
            out.actions,
            vec![Action::CallActivity {
                scheduling_event_id: 2,
                name: "A".into(),
                input: "1".into(),
                retry: None
            }]
        );
        assert_eq!(out.history.len(), 2);
        assert!(!out.deferred);
    }

    #[test]
    fn second_new_request_in_one_turn_is_deferred() {
        let out = run_turn("i", vec![started("x")], |ctx| async move {
            let a = ctx.schedule_activity("A", "1");
            let b = ctx.schedule_activity("B", "2");
            let results = ctx.join(vec![a, b]).await;
            Ok(format!("{}", results.len()))
        });
        assert_eq!(out.actions.len(), 1);
        assert!(out.deferred);
    }

    #[test]
    fn completed_history_resolves_the_call() {
        let history = vec![
            started("x"),
            Event::new(
                2,
                None,
                EventKind::ActivityScheduled {
                    name: "A".into(),
                    input: "1".into(),
                    retry: None,
                },
            ),
            Event::new(3, Some(2), EventKind::ActivityCompleted { result: "r".into() }),
        ];
        let out = run_turn("i", history, |ctx| async move { ctx.schedule_activity("A", "1").await });
        assert_eq!(out.output, Some(Ok("r".to_string())));
        assert!(out.actions.is_empty());
    }

    #[test]
    fn mismatched_replay_is_flagged() {
        let history = vec![
            started("x"),
            Event::new(
                2,
                None,
                EventKind::ActivityScheduled {
                    name: "A".into(),
                    input: "1".into(),
                    retry: None,
                },
            ),
        ];
        let out = run_turn("i", history, |ctx| async move { ctx.schedule_activity("B", "1").await });
        assert!(out.output.is_none());
        assert!(out.nondeterminism.unwrap().contains("activity 'B'"));
    }

    #[test]
    fn sub_orchestration_ids_are_derived_from_parent_and_event() {
        let out = run_turn("parent", vec![started("x")], |ctx| async move {
            ctx.schedule_sub_orchestration("child", "in").await
        });
        match &out.actions[0] {
            Action::StartSubOrchestration { instance, .. } => assert_eq!(instance, "parent::sub::2"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let e = Event::new(3, Some(2), EventKind::ActivityCompleted { result: "ok".into() });
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"]["type"], "ActivityCompleted");
        assert_eq!(json["source_event_id"], 2);
    }
}

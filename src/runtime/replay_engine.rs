//! One deterministic evaluation of an orchestration against its history.
//!
//! The dispatcher feeds a locked batch into a `ReplayEngine`: completion messages become
//! history events, the definition is re-run once from the top, and whatever the turn
//! produced (new scheduling events, a terminal event) is collected as `history_delta`
//! for the provider to commit atomically.

use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Action, Error, Event, EventKind, INITIAL_EVENT_ID};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Suspended on at least one outstanding call.
    Continue,
    Completed(String),
    Failed(Error),
}

/// Replays history and executes one deterministic orchestration evaluation
pub struct ReplayEngine {
    instance: String,
    /// Persisted history at the start of the run
    baseline_history: Vec<Event>,
    /// Events produced by this run, in order
    history_delta: Vec<Event>,
    /// Actions to dispatch once the delta is committed
    pending_actions: Vec<Action>,
    next_event_id: u64,
    /// Error that fails the instance without running user code
    abort_error: Option<Error>,
    deferred: bool,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, baseline_history: Vec<Event>) -> Self {
        let instance = instance.into();
        let abort_error = check_sequence(&baseline_history).err();
        if let Some(err) = &abort_error {
            warn!(instance = %instance, error = %err, "history failed validation");
        }
        let next_event_id = baseline_history
            .last()
            .map(|e| e.event_id + 1)
            .unwrap_or(INITIAL_EVENT_ID);
        Self {
            instance,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            abort_error,
            deferred: false,
        }
    }

    /// Append an event produced outside the definition (start, termination).
    pub fn append(&mut self, source_event_id: Option<u64>, kind: EventKind) -> &Event {
        let event = Event::new(self.next_event_id, source_event_id, kind);
        self.next_event_id += 1;
        self.history_delta.push(event);
        &self.history_delta[self.history_delta.len() - 1]
    }

    fn full_history(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn scheduled_kind(&self, id: u64) -> Option<&EventKind> {
        self.full_history()
            .find(|e| e.event_id == id && e.kind.is_schedule())
            .map(|e| &e.kind)
    }

    fn has_completion(&self, id: u64) -> bool {
        self.full_history()
            .any(|e| e.source_event_id == Some(id) && e.kind.is_completion())
    }

    /// Convert completion messages into history events.
    ///
    /// Redelivered completions are dropped. A completion that answers no scheduling event,
    /// or answers one of the other kind, means the history cannot be trusted and aborts the
    /// turn with `CorruptHistory`.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        debug!(
            instance = %self.instance,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            let (id, kind, wants_activity) = match msg {
                WorkItem::ActivityCompleted { id, result, .. } => (
                    *id,
                    EventKind::ActivityCompleted { result: result.clone() },
                    true,
                ),
                WorkItem::ActivityFailed { id, error, .. } => {
                    (*id, EventKind::ActivityFailed { error: error.clone() }, true)
                }
                WorkItem::SubOrchCompleted { parent_id, result, .. } => (
                    *parent_id,
                    EventKind::SubOrchestrationCompleted { result: result.clone() },
                    false,
                ),
                WorkItem::SubOrchFailed { parent_id, error, .. } => (
                    *parent_id,
                    EventKind::SubOrchestrationFailed { error: error.clone() },
                    false,
                ),
                _ => continue,
            };

            let scheduled_activity = self
                .scheduled_kind(id)
                .map(|k| matches!(k, EventKind::ActivityScheduled { .. }));
            let expected = match scheduled_activity {
                Some(is_activity) => is_activity,
                None => {
                    self.abort(format!("{} for event {id} answers no scheduled call", msg.kind()));
                    continue;
                }
            };
            if expected != wants_activity {
                self.abort(format!(
                    "{} for event {id} does not match the scheduled call kind",
                    msg.kind()
                ));
                continue;
            }
            if self.has_completion(id) {
                warn!(instance = %self.instance, id, kind = msg.kind(), "ignoring duplicate completion");
                continue;
            }
            self.append(Some(id), kind);
        }
    }

    fn abort(&mut self, message: String) {
        warn!(instance = %self.instance, error = %message, "detected nondeterminism in completion batch");
        self.abort_error.get_or_insert(Error::CorruptHistory(message));
    }

    /// Run the definition once. A terminal outcome appends the matching terminal event.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        debug!(instance = %self.instance, "executing orchestration turn");

        if let Some(err) = self.abort_error.clone() {
            return self.fail(err);
        }
        if !matches!(
            self.full_history().next().map(|e| &e.kind),
            Some(EventKind::OrchestrationStarted { .. })
        ) {
            return self.fail(Error::CorruptHistory(
                "history does not begin with OrchestrationStarted".to_string(),
            ));
        }

        let working_history: Vec<Event> = self.full_history().cloned().collect();
        let working_len = working_history.len();
        let instance = self.instance.clone();

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn(&instance, working_history, move |ctx| async move {
                handler.invoke(ctx, input).await
            })
        }));

        let turn = match run_result {
            Ok(turn) => turn,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                warn!(instance = %self.instance, panic = %msg, "orchestration panicked");
                return self.fail(Error::Orchestration(format!("orchestration panicked: {msg}")));
            }
        };

        // Scheduling events recorded by a nondeterministic turn are discarded
        if let Some(message) = turn.nondeterminism {
            return self.fail(Error::CorruptHistory(message));
        }

        let new_events = turn.history.into_iter().skip(working_len);
        for event in new_events {
            self.next_event_id = event.event_id + 1;
            self.history_delta.push(event);
        }
        self.deferred = turn.deferred;

        match turn.output {
            Some(Ok(output)) => {
                self.append(None, EventKind::OrchestrationCompleted { output: output.clone() });
                TurnResult::Completed(output)
            }
            Some(Err(error)) => self.fail(error),
            None => {
                self.pending_actions = turn.actions;
                TurnResult::Continue
            }
        }
    }

    fn fail(&mut self, error: Error) -> TurnResult {
        self.pending_actions.clear();
        self.deferred = false;
        self.append(None, EventKind::OrchestrationFailed { error: error.clone() });
        TurnResult::Failed(error)
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn into_history_delta(self) -> Vec<Event> {
        self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// A further new call was held back and needs another turn.
    pub fn has_deferred_schedules(&self) -> bool {
        self.deferred
    }
}

/// Event ids must run 1, 2, 3, ... without gaps.
fn check_sequence(history: &[Event]) -> Result<(), Error> {
    for (idx, event) in history.iter().enumerate() {
        let expected = INITIAL_EVENT_ID + idx as u64;
        if event.event_id != expected {
            return Err(Error::CorruptHistory(format!(
                "expected event {expected}, found {}",
                event.event_id
            )));
        }
    }
    Ok(())
}

/// Outcome of a pure advance over a stored history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    /// The call the instance is now suspended on, if this advance scheduled one.
    pub awaiting: Option<Action>,
    /// Final result once the instance is terminal.
    pub result: Option<Result<String, Error>>,
    /// Events this advance would append.
    pub history_delta: Vec<Event>,
}

/// Re-derive the next step of `instance` from `history` alone.
///
/// No store or queue is touched, so two calls with the same history always agree.
pub fn advance(handler: Arc<dyn OrchestrationHandler>, instance: &str, history: &[Event]) -> Advance {
    let stored = history.iter().find_map(|e| match &e.kind {
        EventKind::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        EventKind::OrchestrationFailed { error } => Some(Err(error.clone())),
        EventKind::OrchestrationTerminated { reason } => Some(Err(Error::Terminated(reason.clone()))),
        _ => None,
    });
    if let Some(result) = stored {
        return Advance {
            awaiting: None,
            result: Some(result),
            history_delta: Vec::new(),
        };
    }

    let input = match history.first().map(|e| &e.kind) {
        Some(EventKind::OrchestrationStarted { input, .. }) => input.clone(),
        _ => {
            return Advance {
                awaiting: None,
                result: Some(Err(Error::CorruptHistory(
                    "history does not begin with OrchestrationStarted".to_string(),
                ))),
                history_delta: Vec::new(),
            };
        }
    };

    let mut engine = ReplayEngine::new(instance, history.to_vec());
    let result = match engine.execute_orchestration(handler, input) {
        TurnResult::Continue => None,
        TurnResult::Completed(output) => Some(Ok(output)),
        TurnResult::Failed(error) => Some(Err(error)),
    };
    Advance {
        awaiting: engine.pending_actions().first().cloned(),
        result,
        history_delta: engine.into_history_delta(),
    }
}

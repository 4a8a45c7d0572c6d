//! Orchestration dispatcher implementation for Runtime
//!
//! Each worker loops over:
//! - fetch a locked batch (instance history plus queued messages)
//! - handle start, termination and completion messages through a `ReplayEngine`
//! - commit the history delta, dispatched work and status change in one ack

use crate::providers::{ExecutionMetadata, OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::{Action, Error, Event, EventKind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::super::Runtime;

/// Parent link recorded in a child's `OrchestrationStarted` event.
struct ParentLink {
    instance: String,
    scheduling_event_id: u64,
}

/// Committable result of one batch.
#[derive(Default)]
struct TurnCommit {
    history_delta: Vec<Event>,
    worker_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Instance-level locking in the provider prevents concurrent turns of one instance
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some(item)) => {
                                rt.process_orchestration_item(item, &worker_id).await;
                            }
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(rt.options.dispatcher_idle_sleep_ms)).await;
                            }
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "Error fetching orchestration item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    /// Run one locked batch and commit it.
    pub(in crate::runtime) async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem, worker_id: &str) {
        let instance = item.instance.clone();
        let lock_token = item.lock_token.clone();
        let history_was_empty = item.history.is_empty();

        if item.history.iter().any(Event::is_terminal) {
            tracing::debug!(
                target: "agentflow::runtime",
                instance_id = %instance,
                dropped = item.messages.len(),
                "Instance is terminal, dropping late messages"
            );
            let _ = self
                .ack_orchestration_with_changes(&lock_token, vec![], vec![], vec![], ExecutionMetadata::default())
                .await;
            return;
        }

        let Some(commit) = self.build_commit(item, worker_id) else {
            let _ = self
                .ack_orchestration_with_changes(&lock_token, vec![], vec![], vec![], ExecutionMetadata::default())
                .await;
            return;
        };

        let metadata = ExecutionMetadata::from_delta(&commit.history_delta);
        let result = self
            .ack_orchestration_with_changes(
                &lock_token,
                commit.history_delta.clone(),
                commit.worker_items,
                commit.orchestrator_items,
                metadata,
            )
            .await;

        let Err(e) = result else {
            return;
        };
        tracing::error!(
            target: "agentflow::runtime",
            instance_id = %instance,
            worker_id = %worker_id,
            error = %e,
            "Failed to commit orchestration turn"
        );
        if e.is_retryable() {
            let _ = self.history_store.abandon_orchestration_item(&lock_token).await;
            return;
        }

        // Rejected deltas cannot succeed on redelivery; record the failure instead
        let mut delta: Vec<Event> = Vec::new();
        let mut next_id = commit.history_delta.first().map(|e| e.event_id).unwrap_or(crate::INITIAL_EVENT_ID);
        if history_was_empty {
            if let Some(started) = commit.history_delta.first() {
                delta.push(started.clone());
                next_id = started.event_id + 1;
            }
        }
        let error = Error::Store(e.to_string());
        delta.push(Event::new(next_id, None, EventKind::OrchestrationFailed { error }));
        let metadata = ExecutionMetadata::from_delta(&delta);
        if self
            .ack_orchestration_with_changes(&lock_token, delta, vec![], vec![], metadata)
            .await
            .is_err()
        {
            let _ = self.history_store.abandon_orchestration_item(&lock_token).await;
        }
    }

    /// Decide what this batch appends and dispatches. `None` means nothing to do.
    fn build_commit(&self, item: OrchestrationItem, worker_id: &str) -> Option<TurnCommit> {
        let OrchestrationItem {
            instance,
            history,
            messages,
            ..
        } = item;

        let mut engine = ReplayEngine::new(instance.clone(), history.clone());

        let started_kind = match history.first() {
            Some(event) => event.kind.clone(),
            None => {
                let Some(WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    parent_instance,
                    parent_id,
                    ..
                }) = messages.iter().find(|m| matches!(m, WorkItem::StartOrchestration { .. }))
                else {
                    warn!(instance = %instance, messages = messages.len(), "messages for an instance that never started");
                    return None;
                };
                let kind = EventKind::OrchestrationStarted {
                    name: orchestration.clone(),
                    input: input.clone(),
                    parent_instance: parent_instance.clone(),
                    parent_id: *parent_id,
                };
                engine.append(None, kind.clone());
                kind
            }
        };

        let (name, input, parent) = match started_kind {
            EventKind::OrchestrationStarted {
                name,
                input,
                parent_instance,
                parent_id,
            } => {
                let parent = parent_instance
                    .zip(parent_id)
                    .map(|(instance, scheduling_event_id)| ParentLink {
                        instance,
                        scheduling_event_id,
                    });
                (name, input, parent)
            }
            other => {
                let error = Error::CorruptHistory(format!(
                    "history begins with {} instead of OrchestrationStarted",
                    other.name()
                ));
                return Some(self.failed_commit(engine, error, None));
            }
        };

        let mut commit = TurnCommit::default();

        if let Some(reason) = messages.iter().find_map(|m| match m {
            WorkItem::CancelInstance { reason, .. } => Some(reason.clone()),
            _ => None,
        }) {
            tracing::info!(
                target: "agentflow::runtime",
                instance_id = %instance,
                orchestration_name = %name,
                worker_id = %worker_id,
                reason = %reason,
                "Orchestration terminated"
            );
            let outstanding = outstanding_children(history.iter().chain(engine.history_delta().iter()));
            for child in outstanding {
                commit.orchestrator_items.push(WorkItem::CancelInstance {
                    instance: child,
                    reason: format!("parent instance {instance} terminated: {reason}"),
                });
            }
            engine.append(None, EventKind::OrchestrationTerminated { reason: reason.clone() });
            if let Some(parent) = &parent {
                commit.orchestrator_items.push(WorkItem::SubOrchFailed {
                    parent_instance: parent.instance.clone(),
                    parent_id: parent.scheduling_event_id,
                    error: Error::Terminated(reason),
                });
            }
            commit.history_delta = engine.into_history_delta();
            return Some(commit);
        }

        let Some(handler) = self.orchestration_registry.get(&name) else {
            tracing::error!(
                target: "agentflow::runtime",
                instance_id = %instance,
                orchestration_name = %name,
                worker_id = %worker_id,
                "Orchestration not registered"
            );
            let error = Error::UnknownOrchestration(name);
            return Some(self.failed_commit(engine, error, parent));
        };

        engine.prep_completions(&messages);
        let turn = engine.execute_orchestration(handler, input);

        for action in engine.pending_actions() {
            match action.clone() {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                    retry,
                } => commit.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    id: scheduling_event_id,
                    name,
                    input,
                    retry,
                }),
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    instance: child,
                    input,
                } => commit.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    input,
                    parent_instance: Some(instance.clone()),
                    parent_id: Some(scheduling_event_id),
                }),
            }
        }
        if engine.has_deferred_schedules() {
            commit.orchestrator_items.push(WorkItem::Continue {
                instance: instance.clone(),
            });
        }

        match &turn {
            TurnResult::Continue => {
                tracing::debug!(
                    target: "agentflow::runtime",
                    instance_id = %instance,
                    orchestration_name = %name,
                    worker_id = %worker_id,
                    new_events = engine.history_delta().len(),
                    dispatched = engine.pending_actions().len(),
                    deferred = engine.has_deferred_schedules(),
                    "Orchestration turn suspended"
                );
            }
            TurnResult::Completed(output) => {
                tracing::info!(
                    target: "agentflow::runtime",
                    instance_id = %instance,
                    orchestration_name = %name,
                    worker_id = %worker_id,
                    outcome = "completed",
                    "Orchestration completed"
                );
                if let Some(parent) = &parent {
                    commit.orchestrator_items.push(WorkItem::SubOrchCompleted {
                        parent_instance: parent.instance.clone(),
                        parent_id: parent.scheduling_event_id,
                        result: output.clone(),
                    });
                }
            }
            TurnResult::Failed(error) => {
                log_failure(&instance, &name, worker_id, error);
                if let Some(parent) = &parent {
                    commit.orchestrator_items.push(WorkItem::SubOrchFailed {
                        parent_instance: parent.instance.clone(),
                        parent_id: parent.scheduling_event_id,
                        error: error.clone(),
                    });
                }
            }
        }

        commit.history_delta = engine.into_history_delta();
        Some(commit)
    }

    /// Fail the instance without running user code.
    fn failed_commit(&self, mut engine: ReplayEngine, error: Error, parent: Option<ParentLink>) -> TurnCommit {
        engine.append(None, EventKind::OrchestrationFailed { error: error.clone() });
        let mut commit = TurnCommit::default();
        if let Some(parent) = parent {
            commit.orchestrator_items.push(WorkItem::SubOrchFailed {
                parent_instance: parent.instance,
                parent_id: parent.scheduling_event_id,
                error,
            });
        }
        commit.history_delta = engine.into_history_delta();
        commit
    }
}

/// Children scheduled in `history` that have not reported back yet.
fn outstanding_children<'a>(history: impl Iterator<Item = &'a Event>) -> Vec<String> {
    let events: Vec<&Event> = history.collect();
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SubOrchestrationScheduled { instance, .. } => {
                let answered = events
                    .iter()
                    .any(|c| c.source_event_id == Some(e.event_id) && c.kind.is_completion());
                (!answered).then(|| instance.clone())
            }
            _ => None,
        })
        .collect()
}

fn log_failure(instance: &str, name: &str, worker_id: &str, error: &Error) {
    // Engine-level failures point at a deployment or data problem rather than business logic
    if error.is_engine_error() {
        tracing::error!(
            target: "agentflow::runtime",
            instance_id = %instance,
            orchestration_name = %name,
            worker_id = %worker_id,
            outcome = "failed",
            error_kind = error.kind(),
            error = %error,
            "Orchestration failed"
        );
    } else {
        tracing::warn!(
            target: "agentflow::runtime",
            instance_id = %instance,
            orchestration_name = %name,
            worker_id = %worker_id,
            outcome = "failed",
            error_kind = error.kind(),
            error = %error,
            "Orchestration failed"
        );
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, InstanceInfo, InstanceStatus, OrchestrationItem, Provider, ProviderError, WorkItem,
    new_lock_token, now_millis, validate_delta,
};
use crate::{Event, EventKind};

struct InstanceRecord {
    info: InstanceInfo,
    history: Vec<Event>,
}

struct QueuedMessage {
    item: WorkItem,
    lock_token: Option<String>,
}

struct QueuedWork {
    item: WorkItem,
    lock: Option<(String, Instant)>,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRecord>,
    // creation order for list_instances
    order: Vec<String>,
    orchestrator_queue: Vec<QueuedMessage>,
    // instance -> (lock token, locked until)
    instance_locks: HashMap<String, (String, Instant)>,
    worker_queue: Vec<QueuedWork>,
}

impl State {
    fn insert_instance(&mut self, instance: &str, orchestration: &str, input: &str, parent: Option<&str>) {
        let now = now_millis();
        self.order.push(instance.to_string());
        self.instances.insert(
            instance.to_string(),
            InstanceRecord {
                info: InstanceInfo {
                    instance_id: instance.to_string(),
                    orchestration_name: orchestration.to_string(),
                    input: input.to_string(),
                    status: InstanceStatus::Running,
                    output: None,
                    error: None,
                    parent_instance: parent.map(str::to_string),
                    created_at_ms: now,
                    updated_at_ms: now,
                },
                history: Vec::new(),
            },
        );
    }

    fn lock_owner(&self, lock_token: &str) -> Option<String> {
        self.instance_locks
            .iter()
            .find(|(_, (token, _))| token == lock_token)
            .map(|(instance, _)| instance.clone())
    }
}

/// Non-durable provider for tests and local experiments.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        state.insert_instance(instance, orchestration, input, parent_instance);
        Ok(())
    }

    async fn start_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(instance) {
            return Err(ProviderError::permanent(
                "start_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        state.insert_instance(instance, orchestration, input, None);
        state.orchestrator_queue.push(QueuedMessage {
            item: WorkItem::StartOrchestration {
                instance: instance.to_string(),
                orchestration: orchestration.to_string(),
                input: input.to_string(),
                parent_instance: None,
                parent_id: None,
            },
            lock_token: None,
        });
        Ok(())
    }

    async fn append_event(
        &self,
        instance: &str,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Result<Event, ProviderError> {
        let mut state = self.state.lock().await;
        let record = state
            .instances
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append_event", format!("instance not found: {instance}")))?;
        let event_id = record.history.last().map(|e| e.event_id + 1).unwrap_or(crate::INITIAL_EVENT_ID);
        let event = Event::new(event_id, source_event_id, kind);
        record.history.push(event.clone());
        record.info.updated_at_ms = now_millis();
        Ok(event)
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .map(|r| r.history.clone())
            .unwrap_or_default())
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.get(instance).map(|r| r.info.clone()))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.state.lock().await.order.clone())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.orchestrator_queue.push(QueuedMessage { item, lock_token: None });
        Ok(())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // Expired locks give their messages back
        let expired: Vec<String> = state
            .instance_locks
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(instance, (token, _))| {
                tracing::debug!(target: "agentflow::providers::in_memory", instance_id = %instance, "orchestration lock expired");
                token.clone()
            })
            .collect();
        for token in expired {
            for msg in state.orchestrator_queue.iter_mut() {
                if msg.lock_token.as_deref() == Some(token.as_str()) {
                    msg.lock_token = None;
                }
            }
            state.instance_locks.retain(|_, (t, _)| *t != token);
        }

        let Some(instance) = state
            .orchestrator_queue
            .iter()
            .find(|m| m.lock_token.is_none() && !state.instance_locks.contains_key(m.item.instance()))
            .map(|m| m.item.instance().to_string())
        else {
            return Ok(None);
        };

        let lock_token = new_lock_token();
        state
            .instance_locks
            .insert(instance.clone(), (lock_token.clone(), now + lock_timeout));
        let mut messages = Vec::new();
        for msg in state.orchestrator_queue.iter_mut() {
            if msg.lock_token.is_none() && msg.item.instance() == instance {
                msg.lock_token = Some(lock_token.clone());
                messages.push(msg.item.clone());
            }
        }
        let history = state
            .instances
            .get(&instance)
            .map(|r| r.history.clone())
            .unwrap_or_default();

        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let instance = state
            .lock_owner(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "invalid lock token"))?;

        // Validate before mutating anything
        let last = state
            .instances
            .get(&instance)
            .and_then(|r| r.history.last().map(|e| e.event_id))
            .unwrap_or(0);
        if !history_delta.is_empty() && !state.instances.contains_key(&instance) {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                format!("instance not found: {instance}"),
            ));
        }
        validate_delta(last, &history_delta).map_err(|m| ProviderError::permanent("ack_orchestration_item", m))?;

        let now = now_millis();
        if let Some(record) = state.instances.get_mut(&instance) {
            record.history.extend(history_delta);
            if let Some(status) = metadata.status {
                record.info.status = status;
                record.info.output = metadata.output;
                record.info.error = metadata.error;
            }
            record.info.updated_at_ms = now;
        }

        state.orchestrator_queue.retain(|m| m.lock_token.as_deref() != Some(lock_token));
        state.instance_locks.remove(&instance);

        for item in worker_items {
            state.worker_queue.push(QueuedWork { item, lock: None });
        }
        for item in orchestrator_items {
            if let WorkItem::StartOrchestration {
                instance: child,
                orchestration,
                input,
                parent_instance,
                ..
            } = &item
            {
                if !state.instances.contains_key(child) {
                    state.insert_instance(child, orchestration, input, parent_instance.as_deref());
                }
            }
            state.orchestrator_queue.push(QueuedMessage { item, lock_token: None });
        }
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let instance = state
            .lock_owner(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "invalid lock token"))?;
        for msg in state.orchestrator_queue.iter_mut() {
            if msg.lock_token.as_deref() == Some(lock_token) {
                msg.lock_token = None;
            }
        }
        state.instance_locks.remove(&instance);
        Ok(())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(work) = state
            .worker_queue
            .iter_mut()
            .find(|w| w.lock.as_ref().is_none_or(|(_, until)| *until <= now))
        else {
            return Ok(None);
        };
        let token = new_lock_token();
        work.lock = Some((token.clone(), now + lock_timeout));
        Ok(Some((work.item.clone(), token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let before = state.worker_queue.len();
        state
            .worker_queue
            .retain(|w| w.lock.as_ref().is_none_or(|(token, _)| token != lock_token));
        if state.worker_queue.len() == before {
            return Err(ProviderError::permanent("ack_work_item", "invalid lock token"));
        }
        state.orchestrator_queue.push(QueuedMessage {
            item: completion,
            lock_token: None,
        });
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        for work in state.worker_queue.iter_mut() {
            if work.lock.as_ref().is_some_and(|(token, _)| token == lock_token) {
                work.lock = None;
                return Ok(());
            }
        }
        Err(ProviderError::permanent("abandon_work_item", "invalid lock token"))
    }
}

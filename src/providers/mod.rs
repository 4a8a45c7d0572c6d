//! Instance store abstraction.
//!
//! A provider owns three things: instance records with their append-only histories, the
//! orchestrator queue (messages that wake an instance) and the worker queue (activities to
//! execute). The runtime never touches storage directly; every state change of an instance
//! goes through one atomic [`Provider::ack_orchestration_item`] while the instance is locked.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Event, EventKind, RetryPolicy};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Lifecycle status of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Terminated => "Terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(InstanceStatus::Running),
            "Completed" => Ok(InstanceStatus::Completed),
            "Failed" => Ok(InstanceStatus::Failed),
            "Terminated" => Ok(InstanceStatus::Terminated),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// Instance record as kept by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub input: String,
    pub status: InstanceStatus,
    pub output: Option<String>,
    pub error: Option<Error>,
    pub parent_instance: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Status change computed by the runtime for an ack. `None` fields leave the record as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub status: Option<InstanceStatus>,
    pub output: Option<String>,
    pub error: Option<Error>,
}

impl ExecutionMetadata {
    /// Derive the status change from the terminal event in a history delta, if any.
    pub fn from_delta(delta: &[Event]) -> Self {
        for event in delta {
            match &event.kind {
                EventKind::OrchestrationCompleted { output } => {
                    return Self {
                        status: Some(InstanceStatus::Completed),
                        output: Some(output.clone()),
                        error: None,
                    };
                }
                EventKind::OrchestrationFailed { error } => {
                    return Self {
                        status: Some(InstanceStatus::Failed),
                        output: None,
                        error: Some(error.clone()),
                    };
                }
                EventKind::OrchestrationTerminated { reason } => {
                    return Self {
                        status: Some(InstanceStatus::Terminated),
                        output: None,
                        error: Some(Error::Terminated(reason.clone())),
                    };
                }
                _ => {}
            }
        }
        Self::default()
    }
}

/// Queue message. Orchestrator-queue items wake an instance; `ActivityExecute` lives on
/// the worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: Error,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_id: u64,
        error: Error,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    /// Wake the instance for another turn without new input.
    Continue {
        instance: String,
    },
}

impl WorkItem {
    /// Instance whose queue this item belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::Continue { instance } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::CancelInstance { .. } => "CancelInstance",
            WorkItem::Continue { .. } => "Continue",
        }
    }
}

/// Locked batch for one instance: its history plus every message queued for it.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Create a `Running` instance record with an empty history.
    /// Fails permanently if the id is taken.
    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Create a top-level `Running` record and queue its `StartOrchestration` message as
    /// one atomic step, so a record never exists without the message that drives it.
    /// Fails permanently if the id is taken.
    async fn start_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError>;

    /// Append one event, assigning the next sequence number. Appends to the same instance
    /// are serialized.
    async fn append_event(
        &self,
        instance: &str,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Result<Event, ProviderError>;

    /// Full history ordered by event id. Empty for unknown instances.
    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    /// Instance ids ordered by creation.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the oldest instance with queued messages that nobody else holds.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Atomically: append `history_delta` (must continue the sequence), enqueue worker and
    /// orchestrator items (creating records for started children), apply `metadata`, drop
    /// the fetched messages and release the lock.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release the lock and make the messages visible again.
    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete the locked work item and enqueue its completion in one step.
    async fn ack_work_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError>;
}

/// Check that `delta` continues a history whose last event id is `last_event_id`.
pub(crate) fn validate_delta(last_event_id: u64, delta: &[Event]) -> Result<(), String> {
    let mut expected = last_event_id + 1;
    for event in delta {
        if event.event_id != expected {
            return Err(format!("expected event {expected}, got {}", event.event_id));
        }
        expected += 1;
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn new_lock_token() -> String {
    format!("lock_{}", uuid::Uuid::new_v4())
}

use std::sync::Arc;
use std::time::Duration;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{InstanceInfo, InstanceStatus, Provider, WorkItem};
use crate::runtime::WaitError;
use crate::{Error, Event, OrchestrationStatus};
use serde::Serialize;

/// Thin client for control-plane operations.
///
/// The client talks to the runtime only through the shared `Provider`: starting an
/// instance creates its record and enqueues a start message, everything else reads the
/// record or enqueues a message. Any number of clients and runtimes may share a store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start `orchestration` under a fresh instance id and return that id.
    pub async fn start_orchestration(&self, orchestration: &str, input: impl Into<String>) -> Result<String, Error> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start `orchestration` under a caller-chosen id. Fails with `InvalidInput` if the id is taken.
    pub async fn start_orchestration_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), Error> {
        if self.store.get_instance_info(instance).await?.is_some() {
            return Err(Error::InvalidInput(format!("instance already exists: {instance}")));
        }
        self.store.start_instance(instance, orchestration, &input.into()).await?;
        tracing::info!(
            target: "agentflow::client",
            instance_id = %instance,
            orchestration_name = %orchestration,
            "Orchestration scheduled"
        );
        Ok(())
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(&self, orchestration: &str, input: &In) -> Result<String, Error> {
        let payload = Json::encode(input)?;
        self.start_orchestration(orchestration, payload).await
    }

    /// Current status. Reading has no side effects, so repeated calls agree until the
    /// instance makes progress.
    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationStatus, Error> {
        let info = self.get_instance(instance).await?;
        Ok(status_of(&info))
    }

    pub async fn get_instance(&self, instance: &str) -> Result<InstanceInfo, Error> {
        self.store
            .get_instance_info(instance)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance.to_string()))
    }

    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, Error> {
        self.get_instance(instance).await?;
        Ok(self.store.read_history(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>, Error> {
        let ids = self.store.list_instances().await?;
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(info) = self.store.get_instance_info(&id).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    /// Request termination. Terminal instances are left as they are.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), Error> {
        let info = self.get_instance(instance).await?;
        if info.status.is_terminal() {
            return Ok(());
        }
        let reason = reason.into();
        tracing::info!(
            target: "agentflow::client",
            instance_id = %instance,
            reason = %reason,
            "Termination requested"
        );
        self.store
            .enqueue_orchestrator_work(WorkItem::CancelInstance {
                instance: instance.to_string(),
                reason,
            })
            .await?;
        Ok(())
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_status(instance).await.map_err(WaitError::Other)?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}

fn status_of(info: &InstanceInfo) -> OrchestrationStatus {
    match info.status {
        InstanceStatus::Running => OrchestrationStatus::Running,
        InstanceStatus::Completed => OrchestrationStatus::Completed {
            output: info.output.clone().unwrap_or_default(),
        },
        InstanceStatus::Failed => OrchestrationStatus::Failed {
            error: info
                .error
                .clone()
                .unwrap_or_else(|| Error::Orchestration("failed without recorded error".to_string())),
        },
        InstanceStatus::Terminated => OrchestrationStatus::Terminated {
            reason: match &info.error {
                Some(Error::Terminated(reason)) => reason.clone(),
                Some(other) => other.message().to_string(),
                None => String::new(),
            },
        },
    }
}

//! Runtime: dispatchers, handler traits and registries.
use crate::providers::{ExecutionMetadata, Provider, ProviderError, WorkItem};
use crate::{Error, Event, OrchestrationContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

pub mod dispatchers;
pub mod registry;
pub mod replay_engine;
pub mod retry;

use async_trait::async_trait;

pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use replay_engine::{Advance, advance};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    /// Lower values = more responsive, higher CPU usage when idle.
    /// Default: 10ms
    pub dispatcher_idle_sleep_ms: u64,
    /// Concurrent orchestration workers. The provider's instance lock keeps each
    /// instance single-writer regardless of this number.
    pub orchestration_concurrency: usize,
    /// Concurrent activity workers.
    pub worker_concurrency: usize,
    /// How long a fetched orchestration batch stays locked before another worker may take it.
    pub orchestrator_lock_timeout: Duration,
    /// How long an activity stays locked. An activity running longer is redelivered.
    pub worker_lock_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            orchestrator_lock_timeout: Duration::from_secs(30),
            worker_lock_timeout: Duration::from_secs(300),
        }
    }
}

/// High-level orchestration status derived from the instance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    Running,
    Completed { output: String },
    Failed { error: Error },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestrationStatus::Running)
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(Error),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Execution context handed to every activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    activity_name: String,
    scheduled_event_id: u64,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(
        instance_id: impl Into<String>,
        activity_name: impl Into<String>,
        scheduled_event_id: u64,
        attempt: u32,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            activity_name: activity_name.into(),
            scheduled_event_id,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Event id of the `ActivityScheduled` event this invocation answers.
    pub fn scheduled_event_id(&self) -> u64 {
        self.scheduled_event_id
    }

    /// 1-based attempt number under the call's retry policy.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "agentflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.scheduled_event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "agentflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.scheduled_event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "agentflow::activity",
            instance_id = %self.instance_id,
            activity_name = %self.activity_name,
            activity_id = self.scheduled_event_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, Error>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, Error>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, Error>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, Error> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, Error>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, Error>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, Error>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, Error> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime that drives orchestrations, executes activities and persists
/// history via a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = crate::logging::init_tracing(crate::logging::DEFAULT_FILTER);

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        tracing::info!(
            target: "agentflow::runtime",
            runtime_id = %runtime_id,
            provider = history_store.name(),
            orchestrations = ?orchestration_registry.list_names(),
            activities = ?activity_registry.list_names(),
            "Runtime starting"
        );

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.push(work_handle);

        runtime
    }

    pub fn orchestration_registry(&self) -> &OrchestrationRegistry {
        &self.orchestration_registry
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.history_store)
    }

    /// Stop all dispatchers. In-flight turns are abandoned and redelivered after their
    /// lock expires; already-persisted history is unaffected.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        // Give workers one idle period to observe the flag
        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms * 2)).await;
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        tracing::info!(target: "agentflow::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }

    /// Acknowledge an orchestration item, retrying retryable provider errors with backoff.
    pub(crate) async fn ack_orchestration_with_changes(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;

        loop {
            match self
                .history_store
                .ack_orchestration_item(
                    lock_token,
                    history_delta.clone(),
                    worker_items.clone(),
                    orchestrator_items.clone(),
                    metadata.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "ack_orchestration_item failed with non-retryable error");
                    return Err(e);
                }
                Err(e) if attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "Failed to ack_orchestration_item after max retries");
                    return Err(e);
                }
            }
        }
    }
}

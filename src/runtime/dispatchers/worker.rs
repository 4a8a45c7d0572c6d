//! Worker (activity) dispatcher implementation for Runtime
//!
//! Workers fetch `ActivityExecute` items under a lock, run the registered handler under the
//! call's retry policy and ack the completion back to the orchestrator queue in one step.
//! A worker that dies mid-activity leaves the lock to expire, so the activity is redelivered.

use crate::providers::WorkItem;
use crate::runtime::{ActivityContext, ActivityHandler, RetryPolicy};
use crate::Error;
use ::futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::warn;

use super::super::Runtime;

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, token))) => rt.process_work_item(item, &token, &worker_id).await,
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(rt.options.dispatcher_idle_sleep_ms)).await;
                            }
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "Error fetching work item");
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

    async fn process_work_item(&self, item: WorkItem, token: &str, worker_id: &str) {
        let WorkItem::ActivityExecute {
            instance,
            id,
            name,
            input,
            retry,
        } = item
        else {
            tracing::error!(
                target: "agentflow::runtime",
                worker_id = %worker_id,
                kind = item.kind(),
                "Unexpected item on the worker queue"
            );
            let _ = self.history_store.abandon_work_item(token).await;
            return;
        };

        tracing::debug!(
            target: "agentflow::runtime",
            instance_id = %instance,
            activity_name = %name,
            activity_id = id,
            worker_id = %worker_id,
            "Activity started"
        );
        let start_time = Instant::now();

        let outcome = match self.activity_registry.get(&name) {
            Some(handler) => {
                let ctx = ActivityContext::new(instance.clone(), name.clone(), id, 1);
                run_with_policy(handler, ctx, input, retry.unwrap_or_default(), self.options.worker_lock_timeout).await
            }
            None => Err(Error::UnknownActivity(name.clone())),
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let completion = match outcome {
            Ok(result) => {
                tracing::debug!(
                    target: "agentflow::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    result_size = result.len(),
                    "Activity completed"
                );
                WorkItem::ActivityCompleted {
                    instance: instance.clone(),
                    id,
                    result,
                }
            }
            Err(error) => {
                tracing::warn!(
                    target: "agentflow::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "failed",
                    error_kind = error.kind(),
                    duration_ms,
                    error = %error,
                    "Activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    id,
                    error,
                }
            }
        };

        if let Err(e) = self.history_store.ack_work_item(token, completion).await {
            warn!(
                instance = %instance,
                id,
                worker_id = %worker_id,
                error = %e,
                "worker: atomic ack failed"
            );
            let _ = self.history_store.abandon_work_item(token).await;
        }
    }
}

/// Invoke `handler` until it succeeds, fails with a non-retryable error, or `policy` runs out
/// of attempts. Timeouts and panics count as activity errors.
///
/// Retries must finish inside `lock_budget`, the lock held on the work item. A retry whose
/// backoff would outlast the lock is not started, and retries are cut off when the lock
/// expires, so a redelivered copy never runs alongside this one.
pub(crate) async fn run_with_policy(
    handler: Arc<dyn ActivityHandler>,
    ctx: ActivityContext,
    input: String,
    policy: RetryPolicy,
    lock_budget: Duration,
) -> Result<String, Error> {
    let deadline = Instant::now() + lock_budget;
    let mut attempt: u32 = 1;
    loop {
        let limit = if attempt == 1 {
            policy.timeout
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            Some(policy.timeout.map_or(remaining, |t| t.min(remaining)))
        };
        let result = run_attempt(handler.as_ref(), ctx.with_attempt(attempt), input.clone(), limit).await;
        match result {
            Err(error) if error.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                if Instant::now() + delay >= deadline {
                    tracing::warn!(
                        target: "agentflow::runtime",
                        instance_id = %ctx.instance_id(),
                        activity_name = %ctx.activity_name(),
                        activity_id = ctx.scheduled_event_id(),
                        attempt,
                        lock_budget_ms = lock_budget.as_millis() as u64,
                        "Retry budget exceeds the worker lock; giving up"
                    );
                    return Err(error);
                }
                tracing::debug!(
                    target: "agentflow::runtime",
                    instance_id = %ctx.instance_id(),
                    activity_name = %ctx.activity_name(),
                    activity_id = ctx.scheduled_event_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying activity"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn run_attempt(
    handler: &dyn ActivityHandler,
    ctx: ActivityContext,
    input: String,
    timeout: Option<Duration>,
) -> Result<String, Error> {
    let name = ctx.activity_name().to_string();
    let call = AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind();
    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(caught) => caught,
            Err(_) => {
                return Err(Error::Activity(format!(
                    "activity '{name}' timed out after {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => call.await,
    };
    caught.unwrap_or_else(|_| Err(Error::Activity(format!("activity '{name}' panicked"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ActivityRegistry, BackoffStrategy};
    use std::sync::atomic::AtomicU32;

    fn ctx() -> ActivityContext {
        ActivityContext::new("inst", "flaky", 2, 1)
    }

    const LOCK: Duration = Duration::from_secs(30);

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_backoff(BackoffStrategy::None)
    }

    #[tokio::test]
    async fn retries_activity_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("flaky", move |ctx: ActivityContext, _input: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Err(Error::Activity("transient".into()))
                    } else {
                        Ok(format!("attempt {}", ctx.attempt()))
                    }
                }
            })
            .build();
        let out = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), fast(5), LOCK).await;
        assert_eq!(out, Ok("attempt 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_input_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("flaky", move |_ctx, _input: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InvalidInput("bad".into()))
                }
            })
            .build();
        let out = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), fast(5), LOCK).await;
        assert_eq!(out.unwrap_err().kind(), "InvalidInput");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_becomes_activity_error() {
        let reg = ActivityRegistry::builder()
            .register("flaky", |_ctx, _input: String| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            })
            .build();
        let policy = fast(1).with_timeout(Duration::from_millis(20));
        let err = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), policy, LOCK)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ActivityError");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_activity_fails_instead_of_killing_the_worker() {
        let reg = ActivityRegistry::builder()
            .register("flaky", |_ctx, input: String| async move {
                if input == "x" {
                    panic!("boom");
                }
                Ok(input)
            })
            .build();
        let err = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), fast(1), LOCK)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn retries_stop_before_the_worker_lock_expires() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let reg = ActivityRegistry::builder()
            .register("flaky", move |_ctx, _input: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Activity("still down".into()))
                }
            })
            .build();
        let policy = RetryPolicy::new(10).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(40),
        });
        let started = Instant::now();
        let err = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), policy, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Activity("still down".into()));
        let attempts = calls.load(Ordering::SeqCst);
        assert!((2..=3).contains(&attempts), "ran {attempts} attempts");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_attempts_are_cut_off_at_the_lock() {
        let reg = ActivityRegistry::builder()
            .register("flaky", |ctx: ActivityContext, _input: String| async move {
                if ctx.attempt() == 1 {
                    return Err(Error::Activity("transient".into()));
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            })
            .build();
        let policy = fast(2);
        let started = Instant::now();
        let err = run_with_policy(reg.get("flaky").unwrap(), ctx(), "x".into(), policy, Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

//! Per-call activity retry and timeout policy.
//!
//! The policy is recorded in the `ActivityScheduled` event and applied by the worker that
//! executes the activity, so retries never add history events. Only
//! [`Error::Activity`](crate::Error::Activity) failures (timeouts included) are retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: u32,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Retries run on the worker that holds the activity's lock, so they share
/// `RuntimeOptions::worker_lock_timeout`. Retries that would outlast the lock are not
/// attempted; the last error is reported instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout. A timed-out attempt counts as an activity error.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    /// A single attempt with no timeout.
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` attempts with the default exponential backoff. Zero is treated as one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether another attempt follows a retryable failure of attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

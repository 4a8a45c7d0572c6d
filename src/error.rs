//! Error kinds surfaced by orchestrations, activities and the instance store.
//!
//! `Error` is recorded verbatim in history (`ActivityFailed`, `OrchestrationFailed`, ...)
//! so it is serializable and comparable. Engine-level kinds are never retried.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// No orchestration registered under this name.
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),
    /// No activity registered under this name.
    #[error("unknown activity: {0}")]
    UnknownActivity(String),
    /// Malformed payload handed to an activity, orchestration or the HTTP start call.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// An activity raised while executing. Carries the underlying cause.
    #[error("activity error: {0}")]
    Activity(String),
    /// History failed replay consistency.
    #[error("corrupt history: {0}")]
    CorruptHistory(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    /// Raised by orchestration code itself, including panics caught by the engine.
    #[error("orchestration error: {0}")]
    Orchestration(String),
    #[error("terminated: {0}")]
    Terminated(String),
    /// Instance store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Stable identifier used in HTTP payloads and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownOrchestration(_) => "UnknownOrchestration",
            Error::UnknownActivity(_) => "UnknownActivity",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Activity(_) => "ActivityError",
            Error::CorruptHistory(_) => "CorruptHistory",
            Error::InstanceNotFound(_) => "InstanceNotFound",
            Error::Orchestration(_) => "OrchestrationError",
            Error::Terminated(_) => "Terminated",
            Error::Store(_) => "StoreError",
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::UnknownOrchestration(m)
            | Error::UnknownActivity(m)
            | Error::InvalidInput(m)
            | Error::Activity(m)
            | Error::CorruptHistory(m)
            | Error::InstanceNotFound(m)
            | Error::Orchestration(m)
            | Error::Terminated(m)
            | Error::Store(m) => m,
        }
    }

    /// Only failures raised by activity code are eligible for a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Activity(_))
    }

    /// Engine-level failures fail the instance immediately and never reach user code.
    pub fn is_engine_error(&self) -> bool {
        matches!(self, Error::UnknownOrchestration(_) | Error::CorruptHistory(_))
    }
}

impl From<crate::providers::ProviderError> for Error {
    fn from(e: crate::providers::ProviderError) -> Self {
        Error::Store(e.to_string())
    }
}

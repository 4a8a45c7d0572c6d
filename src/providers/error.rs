/// Instance store failure with a retry classification.
///
/// **Retryable**: database busy or locked, pool timeouts, I/O hiccups.
///
/// **Permanent**: unknown instance, duplicate instance id, invalid lock token,
/// non-contiguous history delta, undecodable rows.
///
/// The runtime retries retryable acks with backoff and gives up on permanent ones.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Store operation that failed, e.g. `ack_orchestration_item`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

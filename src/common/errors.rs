use thiserror::Error;

/// Errors raised by the reconciler. Cloneable so a single in-flight refresh
/// can hand the same failure to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("invalid chain data in `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("group {0} not found")]
    GroupNotFound(u64),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("Transaction timed out")]
    Timeout,
    #[error("payment {tx_hash} succeeded but fulfillment failed: {message}")]
    FulfillmentFailed { tx_hash: String, message: String },
    #[error("step `{step}` cannot move from {from} to {to}")]
    InvalidTransition { step: String, from: String, to: String },
    #[error("unknown step `{0}`")]
    UnknownStep(String),
    #[error("history store error: {0}")]
    Store(String),
}

impl ReconcileError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        ReconcileError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Chain collaborators speak `anyhow`; anything they raise is treated as
    /// a retryable I/O failure.
    pub fn transient(err: anyhow::Error) -> Self {
        ReconcileError::Transient(format!("{:#}", err))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Transient(_) | ReconcileError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

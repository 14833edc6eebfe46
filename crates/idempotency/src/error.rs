use thiserror::Error;

/// Errors produced by the idempotency guard and its stores.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Another caller holds the key and has not finished yet.
    #[error("Operation for key '{key}' is already in progress")]
    OperationInProgress { key: String },

    /// The guarded operation failed. The failure is recorded against the
    /// key; a later call may attempt the operation again.
    #[error("Operation for key '{key}' failed: {message}")]
    OperationFailed { key: String, message: String },

    /// The backing store is unavailable.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A result could not be serialized or replayed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

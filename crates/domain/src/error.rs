use thiserror::Error;

use common::StreamId;
use event_store::EventStoreError;

/// Errors produced by the domain layer.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The aggregate does not exist.
    #[error("{aggregate_type} not found: {stream_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        stream_id: StreamId,
    },

    /// A business invariant rejected the command. Never auto-retried.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// An event store error occurred.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true if the caller can recover by reloading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            DomainError::EventStore(e) if e.is_concurrency_conflict()
        )
    }
}

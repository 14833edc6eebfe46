use thiserror::Error;

use common::StreamId;
use domain::DomainError;
use event_store::EventStoreError;

/// Errors produced by the saga orchestrator.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga definition is not usable.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// Concurrent workers kept winning the saga stream; the event should be
    /// redelivered.
    #[error("Gave up after {attempts} conflicting writes on saga {stream_id}")]
    ConflictRetriesExhausted { stream_id: StreamId, attempts: u32 },

    /// An event store error occurred.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// A domain-layer error occurred while persisting saga state.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SagaError>;

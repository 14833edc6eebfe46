use thiserror::Error;

use crate::{StreamId, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected version did not match the actual version.
    /// Recoverable: the caller reloads the stream and retries.
    #[error("Concurrency conflict for stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: Version,
        actual: Version,
    },

    /// The events handed to `append` are internally inconsistent
    /// (empty batch, mixed streams, non-sequential versions).
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A snapshot was saved for a version with no corresponding event.
    #[error("Invalid snapshot for stream {stream_id}: version {version} is beyond current version {current}")]
    InvalidSnapshotVersion {
        stream_id: StreamId,
        version: Version,
        current: Version,
    },

    /// A stored event declares a schema version newer than this build
    /// understands. The event is surfaced, never silently dropped.
    #[error("Schema version mismatch for event {event_id}: stored {stored}, supported up to {supported}")]
    SchemaVersionMismatch {
        event_id: uuid::Uuid,
        stored: u16,
        supported: u16,
    },

    /// The backing storage is unavailable or rejected the operation.
    /// Fatal to the call; not auto-retried here.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true if the caller can recover by reloading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

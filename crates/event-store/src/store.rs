use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{EventEnvelope, EventStoreError, Result, Snapshot, StreamId, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the stream for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stream to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the stream to not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// A lazy, finite, ordered stream of events.
///
/// Restartable: calling `read_stream` again with a later `from_version`
/// resumes from that point.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Core trait for event store implementations.
///
/// The store is the source of truth for aggregate state: an append-only,
/// per-stream log with first-writer-wins optimistic concurrency. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream.
    ///
    /// Events are appended atomically - either all succeed or none do - and
    /// one outbox row per event is written in the same atomic unit of work.
    /// If `options.expected_version` is set, the operation fails with
    /// `ConcurrencyConflict` when the current version doesn't match; the
    /// caller reloads and retries.
    ///
    /// Returns the new version of the stream after appending.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// Reads a stream's events in version order, starting at `from_version`
    /// (inclusive). Pass `Version::initial()` to read from the beginning.
    async fn read_stream(&self, stream_id: StreamId, from_version: Version)
    -> Result<EventStream>;

    /// Gets the current version of a stream.
    ///
    /// Returns None if the stream has no events.
    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>>;

    /// Saves a snapshot of an aggregate's state.
    ///
    /// The snapshot version must correspond to an existing event; snapshots
    /// are a pure optimization, never a substitute for the log. An existing
    /// snapshot for the stream is replaced.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Retrieves the latest snapshot for a stream.
    ///
    /// Returns None if no snapshot exists.
    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Reads a stream to completion into a vector.
    async fn read_to_end(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let stream = self.read_stream(stream_id, from_version).await?;
        stream.try_collect().await
    }

    /// Checks if a stream exists (has any events).
    async fn stream_exists(&self, stream_id: StreamId) -> Result<bool> {
        Ok(self.stream_version(stream_id).await?.is_some())
    }

    /// Loads everything needed to rebuild an aggregate: the nearest snapshot
    /// (if any) and the events after it.
    async fn load_for_replay(
        &self,
        stream_id: StreamId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.get_snapshot(stream_id).await? {
            let events = self.read_to_end(stream_id, snapshot.version.next()).await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.read_to_end(stream_id, Version::initial()).await?;
            Ok((None, events))
        }
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates events before appending.
///
/// All events must target the same stream with the same aggregate type, and
/// their versions must be sequential.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    if events.is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    }

    let first = &events[0];
    for event in events.iter().skip(1) {
        if event.stream_id != first.stream_id {
            return Err(EventStoreError::InvalidAppend(
                "All events must be for the same stream".to_string(),
            ));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidAppend(
                "All events must have the same aggregate type".to_string(),
            ));
        }
    }

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "Event versions must be sequential. Expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}

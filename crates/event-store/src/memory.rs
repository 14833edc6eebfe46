use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    CURRENT_SCHEMA_VERSION, EventEnvelope, EventStoreError, Result, Snapshot, StreamId, Version,
    outbox::{OutboxRecord, OutboxRecordId, OutboxStore},
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

/// Events, snapshots, and outbox rows live behind one lock so an append and
/// its outbox writes are a single atomic unit, matching the transactional
/// guarantee of the PostgreSQL implementation.
#[derive(Default)]
struct Inner {
    events: Vec<EventEnvelope>,
    snapshots: HashMap<StreamId, Snapshot>,
    outbox: Vec<OutboxRecord>,
}

/// In-memory event store implementation for testing.
///
/// Provides the same interface and guarantees as the PostgreSQL
/// implementation, including the transactional outbox.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Returns the total number of outbox rows, dispatched or not.
    pub async fn outbox_count(&self) -> usize {
        self.inner.read().await.outbox.len()
    }

    /// Clears all events, snapshots, and outbox rows.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.events.clear();
        inner.snapshots.clear();
        inner.outbox.clear();
    }

    fn current_version(inner: &Inner, stream_id: StreamId) -> Version {
        inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(Version::initial())
    }

    fn check_schema(event: EventEnvelope) -> Result<EventEnvelope> {
        if event.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(EventStoreError::SchemaVersionMismatch {
                event_id: event.event_id.as_uuid(),
                stored: event.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(event)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let first_event = &events[0];
        let stream_id = first_event.stream_id;

        let mut inner = self.inner.write().await;

        let current_version = Self::current_version(&inner, stream_id);

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected,
                actual: current_version,
            });
        }

        // Unique (stream, version) constraint simulation: the batch must
        // continue exactly where the stream currently ends.
        if first_event.version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let mut outbox_rows = Vec::with_capacity(events.len());
        for event in &events {
            outbox_rows.push(OutboxRecord::for_event(event)?);
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(Version::initial());
        inner.events.extend(events);
        inner.outbox.extend(outbox_rows);

        Ok(last_version)
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<EventStream> {
        use futures_util::stream;

        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);

        let stream = stream::iter(events.into_iter().map(Self::check_schema));
        Ok(Box::pin(stream))
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let inner = self.inner.read().await;
        let version = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max();
        Ok(version)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = Self::current_version(&inner, snapshot.stream_id);
        if snapshot.version > current || snapshot.version == Version::initial() {
            return Err(EventStoreError::InvalidSnapshotVersion {
                stream_id: snapshot.stream_id,
                version: snapshot.version,
                current,
            });
        }
        inner.snapshots.insert(snapshot.stream_id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(&stream_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        // Insertion order is creation order.
        let records = inner
            .outbox
            .iter()
            .filter(|r| r.dispatched_at.is_none() && !r.stuck && r.next_attempt_at <= now)
            .take(limit)
            .cloned()
            .collect();
        Ok(records)
    }

    async fn mark_dispatched(&self, id: OutboxRecordId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.outbox.iter_mut().find(|r| r.id == id) {
            record.dispatched_at = Some(Utc::now());
            record.attempts += 1;
            record.last_error = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: OutboxRecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.outbox.iter_mut().find(|r| r.id == id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = next_attempt_at;
            Ok(record.attempts)
        } else {
            Ok(0)
        }
    }

    async fn mark_stuck(&self, id: OutboxRecordId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.outbox.iter_mut().find(|r| r.id == id) {
            record.stuck = true;
        }
        Ok(())
    }

    async fn stuck_count(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.outbox.iter().filter(|r| r.stuck).count() as u64)
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.outbox.len();
        inner
            .outbox
            .retain(|r| !matches!(r.dispatched_at, Some(at) if at < older_than));
        Ok((before - inner.outbox.len()) as u64)
    }
}

//! Transactional outbox records.
//!
//! Every append writes one outbox row per event in the same atomic unit of
//! work as the event itself, so the event log and the outbox never diverge.
//! The relay drains undispatched rows and publishes them to the broker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventEnvelope, EventId, Result, StreamId};

/// Unique identifier for an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxRecordId(Uuid);

impl OutboxRecordId {
    /// Creates a new random record ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OutboxRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row in the transactional outbox.
///
/// `dispatched_at` is set only after the broker acknowledges the publish.
/// A crash between publish and mark leaves the row undispatched, so delivery
/// is at-least-once and downstream consumers must tolerate duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxRecordId,

    /// The stream the source event belongs to. Doubles as the broker
    /// partition key, preserving per-aggregate order.
    pub stream_id: StreamId,

    /// The source event.
    pub event_id: EventId,

    /// The event type, for broker routing and consumer filtering.
    pub event_type: String,

    /// The event payload.
    pub payload: serde_json::Value,

    /// Serialized event metadata (correlation, causation, tenant).
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,

    /// Set only on broker acknowledgment.
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Number of publish attempts so far.
    pub attempts: i32,

    /// Earliest time the next attempt may run (exponential backoff).
    pub next_attempt_at: DateTime<Utc>,

    /// Flagged after retries exhaust; stuck rows wait for an operator and
    /// are never silently dropped.
    pub stuck: bool,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl OutboxRecord {
    /// Creates the outbox row for an event being appended.
    pub fn for_event(event: &EventEnvelope) -> Result<Self> {
        Ok(Self {
            id: OutboxRecordId::new(),
            stream_id: event.stream_id,
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            metadata: serde_json::to_value(&event.metadata)?,
            created_at: event.timestamp,
            dispatched_at: None,
            attempts: 0,
            next_attempt_at: event.timestamp,
            stuck: false,
            last_error: None,
        })
    }
}

/// Storage operations the outbox relay needs.
///
/// Implemented by the same backends as `EventStore`, since outbox rows live
/// next to the events they were committed with.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns undispatched rows eligible for publishing, in creation order.
    ///
    /// Rows flagged stuck and rows still backing off (`next_attempt_at` in
    /// the future) are excluded.
    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks a row dispatched after broker acknowledgment.
    async fn mark_dispatched(&self, id: OutboxRecordId) -> Result<()>;

    /// Records a failed publish attempt. Returns the new attempt count.
    async fn record_failure(
        &self,
        id: OutboxRecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32>;

    /// Flags a row stuck for operator inspection.
    async fn mark_stuck(&self, id: OutboxRecordId) -> Result<()>;

    /// Number of rows currently flagged stuck (operational signal).
    async fn stuck_count(&self) -> Result<u64>;

    /// Removes dispatched rows older than the given time. Returns the number
    /// of rows removed.
    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

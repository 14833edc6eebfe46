use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationId, StreamId, TenantId};

/// Highest event payload schema version this build understands.
///
/// Events stored with a newer version are surfaced as
/// `SchemaVersionMismatch` instead of being deserialized blind.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of an event within its stream, used for optimistic
/// concurrency control.
///
/// Versions start at 1 for the first event and increment by 1 for each
/// subsequent event on a stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an empty stream.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Metadata carried by every stored event.
///
/// Correlation and causation ids tie events back to the business operation
/// and the event that caused them; the tenant id travels with the event so
/// downstream collaborators can apply tenant filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The business operation this event belongs to.
    pub correlation_id: CorrelationId,

    /// The event that caused this one, if any.
    pub causation_id: Option<EventId>,

    /// The tenant on whose behalf this event was produced.
    pub tenant_id: TenantId,
}

impl EventMetadata {
    /// Creates metadata for a root event of a fresh operation.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            causation_id: None,
            tenant_id,
        }
    }

    /// Creates metadata continuing an existing operation.
    pub fn correlated(tenant_id: TenantId, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            causation_id: None,
            tenant_id,
        }
    }

    /// Returns a copy with the causation id set.
    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }
}

/// An event envelope containing a domain event along with its metadata.
///
/// This structure wraps a domain event with all the information needed
/// for storage and retrieval in the event store. Envelopes are immutable
/// once appended; the audit trail never mutates or deletes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "OrderPlaced", "InvoiceApproved").
    pub event_type: String,

    /// The stream this event belongs to.
    pub stream_id: StreamId,

    /// The type of aggregate that owns the stream (e.g., "Order").
    pub aggregate_type: String,

    /// The sequence number of this event within its stream.
    pub version: Version,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Correlation, causation, and tenancy metadata.
    pub metadata: EventMetadata,

    /// Payload schema version for additive evolution.
    pub schema_version: u16,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    stream_id: Option<StreamId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: Option<EventMetadata>,
    schema_version: Option<u16>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the stream ID.
    pub fn stream_id(mut self, id: StreamId) -> Self {
        self.stream_id = Some(id);
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the sequence number.
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the event metadata.
    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the payload schema version. Defaults to `CURRENT_SCHEMA_VERSION`.
    pub fn schema_version(mut self, schema_version: u16) -> Self {
        self.schema_version = Some(schema_version);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if required fields (event_type, stream_id, aggregate_type,
    /// version, payload, metadata) are not set.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.expect("event_type is required"),
            stream_id: self.stream_id.expect("stream_id is required"),
            aggregate_type: self.aggregate_type.expect("aggregate_type is required"),
            version: self.version.expect("version is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.expect("payload is required"),
            metadata: self.metadata.expect("metadata is required"),
            schema_version: self.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION),
        }
    }

    /// Tries to build the event envelope, returning None if required fields
    /// are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            stream_id: self.stream_id?,
            aggregate_type: self.aggregate_type?,
            version: self.version?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload?,
            metadata: self.metadata?,
            schema_version: self.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION),
        })
    }
}

pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use common::{CorrelationId, StreamId, TenantId};
pub use error::{EventStoreError, Result};
pub use event::{
    CURRENT_SCHEMA_VERSION, EventEnvelope, EventEnvelopeBuilder, EventId, EventMetadata, Version,
};
pub use memory::InMemoryEventStore;
pub use outbox::{OutboxRecord, OutboxRecordId, OutboxStore};
pub use postgres::PostgresEventStore;
pub use snapshot::Snapshot;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};

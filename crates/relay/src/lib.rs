//! Outbox relay.
//!
//! Polls the transactional outbox for undispatched rows and publishes them
//! to a message broker, partitioned by stream so per-stream order survives
//! delivery. Delivery is at-least-once: rows are only marked dispatched
//! after the broker acknowledges, so a crash between publish and mark leads
//! to a redelivery, never a loss.

pub mod broker;
pub mod error;
pub mod relay;

pub use broker::{BrokerMessage, InMemoryBroker, MessageBroker};
pub use error::{RelayError, Result};
pub use relay::{DrainStats, OutboxRelay, RelayConfig};

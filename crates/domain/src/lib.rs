pub mod aggregate;
pub mod error;
pub mod repository;

pub use aggregate::{Aggregate, DomainEvent, SnapshotCapable};
pub use common::{CorrelationId, StreamId, TenantId};
pub use error::DomainError;
pub use repository::{AggregateRepository, CommandContext, CommandResult};

pub mod types;

pub use types::{CorrelationId, StreamId, TenantId};

//! Idempotency guard for safely retried operations.
//!
//! Callers wrap side-effecting work in [`IdempotencyGuard::execute`] with a
//! caller-chosen key. Exactly one concurrent caller per key runs the work;
//! later calls with the same key replay the recorded result instead of
//! re-executing. Failed attempts are recorded too, and may be re-attempted.

pub mod error;
pub mod guard;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use guard::{ExecutionOutcome, IdempotencyGuard, WaitConfig};
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use store::{BeginOutcome, IdempotencyStatus, IdempotencyStore, KeyRecord};

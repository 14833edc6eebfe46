//! Saga orchestration.
//!
//! A saga coordinates a multi-step business transaction across aggregates
//! without distributed locks. Each saga type declares its steps and their
//! compensations up front; the orchestrator drives the steps in order,
//! issuing commands through the bus, and unwinds completed steps in reverse
//! when a later step fails or the saga is cancelled.
//!
//! Saga instances are themselves event-sourced: every lifecycle transition
//! is an event on the saga's own stream, appended under the same optimistic
//! concurrency discipline as any other aggregate. That is what makes the
//! orchestrator safe to run in multiple worker processes at once.

pub mod definition;
pub mod error;
pub mod events;
pub mod instance;
pub mod orchestrator;
pub mod state;
pub mod worker;

pub use definition::{SagaDefinition, SagaDefinitionBuilder, SagaStep, StepAction};
pub use error::{Result, SagaError};
pub use events::SagaEvent;
pub use instance::{InFlightStep, SagaInstance};
pub use orchestrator::{RetryPolicy, SagaOrchestrator};
pub use state::SagaStatus;
pub use worker::run_partition_worker;

//! Declarative saga definitions.
//!
//! A definition is the transition table for one saga type: the triggering
//! event, the ordered forward steps, and the compensation registered for
//! each step. The orchestrator only ever moves a saga along this table.

use std::sync::Arc;

use bus::CommandBus;
use common::{CorrelationId, StreamId};
use event_store::EventEnvelope;
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;

/// Result of a forward step: context to merge into the saga's data, or the
/// failure that triggers compensation.
pub type StepOutcome =
    std::result::Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>>;

/// Result of a compensation attempt.
pub type CompensationOutcome =
    std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A forward step's action. It sees the saga's accumulated data and issues
/// commands through the bus.
pub type StepAction = Arc<
    dyn for<'a> Fn(&'a SagaInstance, &'a CommandBus) -> BoxFuture<'a, StepOutcome> + Send + Sync,
>;

/// A step's compensating action.
pub type CompensationAction = Arc<
    dyn for<'a> Fn(&'a SagaInstance, &'a CommandBus) -> BoxFuture<'a, CompensationOutcome>
        + Send
        + Sync,
>;

/// Extracts the correlation id a saga instance is keyed by from a
/// triggering event.
pub type CorrelateFn = Arc<dyn Fn(&EventEnvelope) -> Option<CorrelationId> + Send + Sync>;

/// One forward step of a saga, with its optional compensation.
#[derive(Clone)]
pub struct SagaStep {
    name: &'static str,
    action: StepAction,
    compensation: Option<CompensationAction>,
}

impl SagaStep {
    pub fn new<F>(name: &'static str, action: F) -> Self
    where
        F: for<'a> Fn(&'a SagaInstance, &'a CommandBus) -> BoxFuture<'a, StepOutcome>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            action: Arc::new(action),
            compensation: None,
        }
    }

    /// Registers the compensating action for this step. Steps without a
    /// compensation are simply skipped during unwinding.
    pub fn compensated_by<F>(mut self, compensation: F) -> Self
    where
        F: for<'a> Fn(&'a SagaInstance, &'a CommandBus) -> BoxFuture<'a, CompensationOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn action(&self) -> &StepAction {
        &self.action
    }

    pub(crate) fn compensation(&self) -> Option<&CompensationAction> {
        self.compensation.as_ref()
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

/// The declared transition table for one saga type.
#[derive(Clone)]
pub struct SagaDefinition {
    saga_type: &'static str,
    started_by: String,
    cancelled_by: Option<String>,
    correlate: CorrelateFn,
    steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn builder(saga_type: &'static str) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            saga_type,
            started_by: None,
            cancelled_by: None,
            correlate: None,
            steps: Vec::new(),
        }
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// The event type that starts a new instance of this saga.
    pub fn started_by(&self) -> &str {
        &self.started_by
    }

    /// The event type that requests cancellation, if any.
    pub fn cancelled_by(&self) -> Option<&str> {
        self.cancelled_by.as_deref()
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns true if this definition reacts to the given event type.
    pub fn reacts_to(&self, event_type: &str) -> bool {
        self.started_by == event_type || self.cancelled_by.as_deref() == Some(event_type)
    }

    /// Extracts the correlation id from a triggering event.
    pub fn correlate(&self, envelope: &EventEnvelope) -> Option<CorrelationId> {
        (self.correlate)(envelope)
    }

    /// Derives the deterministic stream id for this saga type and
    /// correlation id.
    ///
    /// The id is a UUIDv5 over (saga_type, correlation_id), so every worker
    /// that sees the same triggering event computes the same stream without
    /// any lookup table, and the event store's version column arbitrates
    /// who creates the instance.
    pub fn saga_stream_id(&self, correlation_id: CorrelationId) -> StreamId {
        let name = format!("{}:{}", self.saga_type, correlation_id);
        StreamId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("started_by", &self.started_by)
            .field("cancelled_by", &self.cancelled_by)
            .field("steps", &self.steps)
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    saga_type: &'static str,
    started_by: Option<String>,
    cancelled_by: Option<String>,
    correlate: Option<CorrelateFn>,
    steps: Vec<SagaStep>,
}

impl SagaDefinitionBuilder {
    /// Sets the event type that starts the saga. Required.
    pub fn started_by(mut self, event_type: impl Into<String>) -> Self {
        self.started_by = Some(event_type.into());
        self
    }

    /// Sets the event type that requests cancellation.
    pub fn cancelled_by(mut self, event_type: impl Into<String>) -> Self {
        self.cancelled_by = Some(event_type.into());
        self
    }

    /// Overrides how the correlation id is extracted from triggering
    /// events. Defaults to the event metadata's correlation id.
    pub fn correlate<F>(mut self, correlate: F) -> Self
    where
        F: Fn(&EventEnvelope) -> Option<CorrelationId> + Send + Sync + 'static,
    {
        self.correlate = Some(Arc::new(correlate));
        self
    }

    /// Appends a forward step. Steps execute in registration order.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> Result<SagaDefinition> {
        let started_by = self.started_by.ok_or_else(|| {
            SagaError::InvalidDefinition(format!(
                "saga '{}' declares no starting event",
                self.saga_type
            ))
        })?;

        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{}' declares no steps",
                self.saga_type
            )));
        }

        for (i, step) in self.steps.iter().enumerate() {
            if self.steps[..i].iter().any(|s| s.name == step.name) {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' declares step '{}' twice",
                    self.saga_type, step.name
                )));
            }
        }

        Ok(SagaDefinition {
            saga_type: self.saga_type,
            started_by,
            cancelled_by: self.cancelled_by,
            correlate: self
                .correlate
                .unwrap_or_else(|| Arc::new(|e: &EventEnvelope| Some(e.metadata.correlation_id))),
            steps: self.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_step(name: &'static str) -> SagaStep {
        SagaStep::new(name, |_saga, _bus| {
            Box::pin(async { Ok(serde_json::json!({})) })
        })
    }

    fn definition() -> SagaDefinition {
        SagaDefinition::builder("OrderFulfillment")
            .started_by("OrderPlaced")
            .cancelled_by("OrderCancellationRequested")
            .step(noop_step("reserve_inventory"))
            .step(noop_step("charge_payment"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_saga_stream_id_is_deterministic() {
        let def = definition();
        let correlation = CorrelationId::new();

        assert_eq!(def.saga_stream_id(correlation), def.saga_stream_id(correlation));
        assert_ne!(
            def.saga_stream_id(correlation),
            def.saga_stream_id(CorrelationId::new())
        );
    }

    #[test]
    fn test_saga_stream_id_differs_per_saga_type() {
        let other = SagaDefinition::builder("InvoiceSettlement")
            .started_by("InvoiceIssued")
            .step(noop_step("collect"))
            .build()
            .unwrap();
        let correlation = CorrelationId::new();

        assert_ne!(
            definition().saga_stream_id(correlation),
            other.saga_stream_id(correlation)
        );
    }

    #[test]
    fn test_reacts_to() {
        let def = definition();
        assert!(def.reacts_to("OrderPlaced"));
        assert!(def.reacts_to("OrderCancellationRequested"));
        assert!(!def.reacts_to("OrderShipped"));
    }

    #[test]
    fn test_builder_rejects_missing_start_event() {
        let result = SagaDefinition::builder("Broken")
            .step(noop_step("only"))
            .build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }

    #[test]
    fn test_builder_rejects_duplicate_steps() {
        let result = SagaDefinition::builder("Broken")
            .started_by("Trigger")
            .step(noop_step("a"))
            .step(noop_step("a"))
            .build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }

    #[test]
    fn test_builder_rejects_no_steps() {
        let result = SagaDefinition::builder("Broken").started_by("Trigger").build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }
}

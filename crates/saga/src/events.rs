//! Saga lifecycle events.
//!
//! Every transition a saga makes is recorded as one of these events on the
//! saga's own stream. Because the stream goes through the regular event
//! store append path, each lifecycle event also lands in the outbox and is
//! published for audit and observability consumers.

use chrono::{DateTime, Utc};
use common::{CorrelationId, StreamId, TenantId};
use domain::DomainEvent;
use serde::{Deserialize, Serialize};

/// Events that can occur during saga execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga execution started.
    SagaStarted(SagaStartedData),

    /// A forward step started execution. Claims the step for one worker;
    /// the claim goes stale after the orchestrator's step timeout.
    StepStarted(StepStartedData),

    /// A forward step completed successfully.
    StepCompleted(StepCompletedData),

    /// A forward step failed; compensation follows.
    StepFailed(StepFailedData),

    /// An explicit cancel was requested; compensation follows.
    CancellationRequested(CancellationData),

    /// Compensation started after a failure or cancellation.
    CompensationStarted(CompensationData),

    /// A compensation step completed successfully.
    CompensationStepCompleted(StepData),

    /// A compensation attempt failed (recorded, then retried).
    CompensationStepFailed(StepFailedData),

    /// All forward steps completed (terminal).
    SagaCompleted(SagaCompletedData),

    /// All compensations completed after failure or cancellation (terminal).
    SagaCompensated(SagaCompensatedData),

    /// A compensation exhausted its retries (terminal).
    SagaFailed(SagaFailedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "SagaStepStarted",
            SagaEvent::StepCompleted(_) => "SagaStepCompleted",
            SagaEvent::StepFailed(_) => "SagaStepFailed",
            SagaEvent::CancellationRequested(_) => "SagaCancellationRequested",
            SagaEvent::CompensationStarted(_) => "SagaCompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "SagaCompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "SagaCompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// Data for SagaStarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    /// The saga's own stream id.
    pub saga_id: StreamId,
    /// The saga type (e.g. "OrderFulfillment").
    pub saga_type: String,
    /// The business operation this saga coordinates.
    pub correlation_id: CorrelationId,
    /// The tenant the triggering event belonged to.
    pub tenant_id: TenantId,
    /// Initial saga data, seeded from the triggering event's payload.
    pub data: serde_json::Value,
    /// When the saga started.
    pub started_at: DateTime<Utc>,
}

/// Data for CompensationStepCompleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepData {
    pub step_name: String,
}

/// Data for StepStarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_name: String,
    /// When the claiming worker appended this event. Used to tell a live
    /// peer's in-flight step from a crashed worker's stale claim.
    pub started_at: DateTime<Utc>,
}

/// Data for StepCompleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_name: String,
    /// Context produced by the step (reservation ids, payment ids, ...),
    /// merged into the saga's data for later steps and compensations.
    pub context: serde_json::Value,
}

/// Data for StepFailed and CompensationStepFailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub error: String,
}

/// Data for CancellationRequested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationData {
    pub reason: String,
}

/// Data for CompensationStarted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationData {
    /// The step (or "cancel") that triggered compensation.
    pub from_step: String,
}

/// Data for SagaCompleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub completed_at: DateTime<Utc>,
}

/// Data for SagaCompensated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompensatedData {
    pub compensated_at: DateTime<Utc>,
}

/// Data for SagaFailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        saga_id: StreamId,
        saga_type: impl Into<String>,
        correlation_id: CorrelationId,
        tenant_id: TenantId,
        data: serde_json::Value,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            saga_type: saga_type.into(),
            correlation_id,
            tenant_id,
            data,
            started_at: Utc::now(),
        })
    }

    pub fn step_started(step_name: impl Into<String>) -> Self {
        SagaEvent::StepStarted(StepStartedData {
            step_name: step_name.into(),
            started_at: Utc::now(),
        })
    }

    pub fn step_completed(step_name: impl Into<String>, context: serde_json::Value) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_name: step_name.into(),
            context,
        })
    }

    pub fn step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    pub fn cancellation_requested(reason: impl Into<String>) -> Self {
        SagaEvent::CancellationRequested(CancellationData {
            reason: reason.into(),
        })
    }

    pub fn compensation_started(from_step: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(CompensationData {
            from_step: from_step.into(),
        })
    }

    pub fn compensation_step_completed(step_name: impl Into<String>) -> Self {
        SagaEvent::CompensationStepCompleted(StepData {
            step_name: step_name.into(),
        })
    }

    pub fn compensation_step_failed(
        step_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            completed_at: Utc::now(),
        })
    }

    pub fn saga_compensated() -> Self {
        SagaEvent::SagaCompensated(SagaCompensatedData {
            compensated_at: Utc::now(),
        })
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }
}

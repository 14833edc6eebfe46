//! The event-sourced saga instance.

use chrono::{DateTime, Utc};
use common::{CorrelationId, StreamId, TenantId};
use domain::Aggregate;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::events::SagaEvent;
use crate::state::SagaStatus;

/// A forward step another worker has started but not yet finished.
///
/// A trailing `StepStarted` with no matching completion means some worker
/// claimed the step and may still be executing its action. The claim is
/// honored until the orchestrator's step timeout passes, after which it is
/// treated as left behind by a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightStep {
    pub step_name: String,
    pub started_at: DateTime<Utc>,
}

impl InFlightStep {
    /// Age of the claim at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

/// A saga instance, rebuilt by replaying its lifecycle events.
///
/// The instance carries everything the orchestrator needs to resume after a
/// crash or a lost race: which steps completed (and in what order), the
/// context each step produced, and the current status. It holds no
/// references to other aggregates; everything is a plain identifier.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    id: Option<StreamId>,
    saga_type: String,
    correlation_id: Option<CorrelationId>,
    tenant_id: Option<TenantId>,
    current_state: String,
    data: serde_json::Value,
    completed_steps: Vec<String>,
    compensated_steps: Vec<String>,
    in_flight_step: Option<InFlightStep>,
    status: SagaStatus,
    failure_reason: Option<String>,
    cancel_reason: Option<String>,
    version: Version,
}

impl SagaInstance {
    /// The saga's own stream id.
    pub fn id(&self) -> Option<StreamId> {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// The declared state the saga is currently in ("started",
    /// "running:<step>", "compensating", or a terminal state name).
    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    /// Accumulated saga data: the triggering payload plus every completed
    /// step's context.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Looks up one context value by key.
    pub fn context(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Forward steps that completed, in completion order.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Steps whose compensations have run, in compensation order.
    pub fn compensated_steps(&self) -> &[String] {
        &self.compensated_steps
    }

    /// The step a worker has started but not yet completed or failed, if
    /// any.
    pub fn in_flight_step(&self) -> Option<&InFlightStep> {
        self.in_flight_step.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    fn merge_context(&mut self, context: serde_json::Value) {
        let serde_json::Value::Object(incoming) = context else {
            return;
        };
        if !self.data.is_object() {
            self.data = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.data.as_object_mut() {
            for (key, value) in incoming {
                map.insert(key, value);
            }
        }
    }
}

impl Aggregate for SagaInstance {
    type Event = SagaEvent;
    type Error = SagaError;

    fn aggregate_type() -> &'static str {
        "Saga"
    }

    fn stream_id(&self) -> Option<StreamId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.saga_id);
                self.saga_type = data.saga_type;
                self.correlation_id = Some(data.correlation_id);
                self.tenant_id = Some(data.tenant_id);
                self.data = if data.data.is_object() {
                    data.data
                } else {
                    serde_json::json!({ "trigger": data.data })
                };
                self.status = SagaStatus::Running;
                self.current_state = "started".to_string();
            }
            SagaEvent::StepStarted(data) => {
                self.current_state = format!("running:{}", data.step_name);
                self.in_flight_step = Some(InFlightStep {
                    step_name: data.step_name,
                    started_at: data.started_at,
                });
            }
            SagaEvent::StepCompleted(data) => {
                self.merge_context(data.context);
                self.completed_steps.push(data.step_name);
                self.in_flight_step = None;
            }
            SagaEvent::StepFailed(data) => {
                self.failure_reason = Some(format!("{}: {}", data.step_name, data.error));
                self.in_flight_step = None;
            }
            SagaEvent::CancellationRequested(data) => {
                self.cancel_reason = Some(data.reason);
            }
            SagaEvent::CompensationStarted(_) => {
                self.status = SagaStatus::Compensating;
                self.current_state = "compensating".to_string();
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.compensated_steps.push(data.step_name);
            }
            // Recorded for the audit trail; the retry loop decides what
            // happens next.
            SagaEvent::CompensationStepFailed(_) => {}
            SagaEvent::SagaCompleted(_) => {
                self.status = SagaStatus::Completed;
                self.current_state = "completed".to_string();
            }
            SagaEvent::SagaCompensated(_) => {
                self.status = SagaStatus::Compensated;
                self.current_state = "compensated".to_string();
            }
            SagaEvent::SagaFailed(data) => {
                self.status = SagaStatus::Failed;
                self.current_state = "failed".to_string();
                self.failure_reason = Some(data.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(saga_id: StreamId) -> SagaEvent {
        SagaEvent::saga_started(
            saga_id,
            "OrderFulfillment",
            CorrelationId::new(),
            TenantId::new(),
            serde_json::json!({"order_id": "o-1"}),
        )
    }

    #[test]
    fn test_happy_path_replay() {
        let saga_id = StreamId::new();
        let mut saga = SagaInstance::default();

        saga.apply_events([
            started(saga_id),
            SagaEvent::step_started("reserve_inventory"),
            SagaEvent::step_completed("reserve_inventory", serde_json::json!({"res": "R-1"})),
            SagaEvent::step_started("charge_payment"),
            SagaEvent::step_completed("charge_payment", serde_json::json!({"pay": "P-1"})),
            SagaEvent::saga_completed(),
        ]);

        assert_eq!(saga.id(), Some(saga_id));
        assert_eq!(saga.saga_type(), "OrderFulfillment");
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.completed_steps(), ["reserve_inventory", "charge_payment"]);
        // Triggering payload and step contexts accumulate in data.
        assert_eq!(saga.context("order_id"), Some(&serde_json::json!("o-1")));
        assert_eq!(saga.context("res"), Some(&serde_json::json!("R-1")));
        assert_eq!(saga.context("pay"), Some(&serde_json::json!("P-1")));
    }

    #[test]
    fn test_compensation_replay() {
        let mut saga = SagaInstance::default();

        saga.apply_events([
            started(StreamId::new()),
            SagaEvent::step_started("reserve_inventory"),
            SagaEvent::step_completed("reserve_inventory", serde_json::json!({"res": "R-1"})),
            SagaEvent::step_started("charge_payment"),
            SagaEvent::step_failed("charge_payment", "card declined"),
            SagaEvent::compensation_started("charge_payment"),
            SagaEvent::compensation_step_completed("reserve_inventory"),
            SagaEvent::saga_compensated(),
        ]);

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.compensated_steps(), ["reserve_inventory"]);
        assert_eq!(
            saga.failure_reason(),
            Some("charge_payment: card declined")
        );
    }

    #[test]
    fn test_failed_compensation_ends_failed() {
        let mut saga = SagaInstance::default();

        saga.apply_events([
            started(StreamId::new()),
            SagaEvent::step_started("reserve_inventory"),
            SagaEvent::step_completed("reserve_inventory", serde_json::json!({})),
            SagaEvent::step_started("charge_payment"),
            SagaEvent::step_failed("charge_payment", "card declined"),
            SagaEvent::compensation_started("charge_payment"),
            SagaEvent::compensation_step_failed("reserve_inventory", "timeout"),
            SagaEvent::saga_failed("compensation for 'reserve_inventory' exhausted"),
        ]);

        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(saga.compensated_steps().is_empty());
    }

    #[test]
    fn test_cancellation_replay() {
        let mut saga = SagaInstance::default();

        saga.apply_events([
            started(StreamId::new()),
            SagaEvent::step_started("reserve_inventory"),
            SagaEvent::step_completed("reserve_inventory", serde_json::json!({})),
            SagaEvent::cancellation_requested("customer withdrew the order"),
            SagaEvent::compensation_started("cancel"),
            SagaEvent::compensation_step_completed("reserve_inventory"),
            SagaEvent::saga_compensated(),
        ]);

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.cancel_reason(), Some("customer withdrew the order"));
    }

    #[test]
    fn test_trailing_step_start_is_tracked_as_in_flight() {
        let mut saga = SagaInstance::default();

        saga.apply_events([
            started(StreamId::new()),
            SagaEvent::step_started("reserve_inventory"),
            SagaEvent::step_completed("reserve_inventory", serde_json::json!({})),
            SagaEvent::step_started("charge_payment"),
        ]);

        let in_flight = saga.in_flight_step().unwrap();
        assert_eq!(in_flight.step_name, "charge_payment");

        // A completion settles the claim.
        saga.apply(SagaEvent::step_completed("charge_payment", serde_json::json!({})));
        assert!(saga.in_flight_step().is_none());

        // So does a failure.
        saga.apply(SagaEvent::step_started("notify"));
        saga.apply(SagaEvent::step_failed("notify", "smtp down"));
        assert!(saga.in_flight_step().is_none());
    }

    #[test]
    fn test_non_object_trigger_payload_is_wrapped() {
        let mut saga = SagaInstance::default();
        saga.apply(SagaEvent::saga_started(
            StreamId::new(),
            "OrderFulfillment",
            CorrelationId::new(),
            TenantId::new(),
            serde_json::json!("raw"),
        ));

        assert_eq!(saga.context("trigger"), Some(&serde_json::json!("raw")));
    }
}

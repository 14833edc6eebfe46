//! The saga orchestrator.

use std::sync::Arc;
use std::time::Duration;

use bus::CommandBus;
use common::{CorrelationId, StreamId, TenantId};
use domain::{Aggregate, DomainEvent};
use event_store::{
    AppendOptions, EventEnvelope, EventId, EventMetadata, EventStore, EventStoreExt, Version,
};

use chrono::Utc;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::instance::{InFlightStep, SagaInstance};
use crate::state::SagaStatus;

/// Retry tuning for the orchestrator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per compensation step before the saga ends `Failed`.
    pub max_compensation_attempts: u32,

    /// Backoff after the first failed compensation attempt; doubles per
    /// attempt.
    pub compensation_backoff: Duration,

    /// Reload-and-retry rounds when a concurrent worker wins the saga
    /// stream.
    pub max_conflict_retries: u32,

    /// How long a `StepStarted` claim is honored before the claiming worker
    /// is presumed dead and the step may be resumed by someone else.
    pub step_timeout: chrono::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_compensation_attempts: 3,
            compensation_backoff: Duration::from_millis(100),
            max_conflict_retries: 3,
            step_timeout: chrono::Duration::seconds(30),
        }
    }
}

/// Identity of the saga stream being advanced, carried through one
/// handling pass.
#[derive(Debug, Clone, Copy)]
struct SagaContext {
    stream_id: StreamId,
    correlation_id: CorrelationId,
    tenant_id: TenantId,
    causation_id: EventId,
}

/// Advances saga instances in response to events.
///
/// Every transition is persisted to the saga's own stream before the next
/// step runs, under optimistic concurrency. When two workers race on the
/// same instance, the loser's append fails with a concurrency conflict; it
/// reloads and resumes from whatever the winner recorded, so each step runs
/// once no matter how many workers see the triggering event.
pub struct SagaOrchestrator<S> {
    store: S,
    bus: CommandBus,
    definitions: Vec<Arc<SagaDefinition>>,
    retry: RetryPolicy,
}

impl<S> SagaOrchestrator<S>
where
    S: EventStore,
{
    pub fn new(store: S, bus: CommandBus, retry: RetryPolicy) -> Self {
        Self {
            store,
            bus,
            definitions: Vec::new(),
            retry,
        }
    }

    /// Registers a saga definition. Each saga type may be registered once.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        if self
            .definitions
            .iter()
            .any(|d| d.saga_type() == definition.saga_type())
        {
            return Err(SagaError::InvalidDefinition(format!(
                "saga type '{}' registered twice",
                definition.saga_type()
            )));
        }
        self.definitions.push(Arc::new(definition));
        Ok(())
    }

    /// Handles one event, advancing every saga definition it triggers.
    ///
    /// Returns the stream ids of the saga instances that were touched.
    #[tracing::instrument(skip(self, envelope), fields(event_type = %envelope.event_type))]
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<Vec<StreamId>> {
        let mut touched = Vec::new();

        let definitions: Vec<Arc<SagaDefinition>> = self
            .definitions
            .iter()
            .filter(|d| d.reacts_to(&envelope.event_type))
            .cloned()
            .collect();

        for definition in definitions {
            if let Some(stream_id) = self.process_trigger(&definition, envelope).await? {
                touched.push(stream_id);
            }
        }

        Ok(touched)
    }

    /// Loads a saga instance by replaying its stream.
    pub async fn get_saga(&self, stream_id: StreamId) -> Result<Option<SagaInstance>> {
        let saga = self.load(stream_id).await?;
        if saga.version() == Version::initial() {
            Ok(None)
        } else {
            Ok(Some(saga))
        }
    }

    async fn process_trigger(
        &self,
        definition: &SagaDefinition,
        envelope: &EventEnvelope,
    ) -> Result<Option<StreamId>> {
        let Some(correlation_id) = definition.correlate(envelope) else {
            tracing::debug!(
                saga_type = definition.saga_type(),
                "triggering event carries no correlation id, skipping"
            );
            return Ok(None);
        };

        let ctx = SagaContext {
            stream_id: definition.saga_stream_id(correlation_id),
            correlation_id,
            tenant_id: envelope.metadata.tenant_id,
            causation_id: envelope.event_id,
        };

        let is_cancel = definition.cancelled_by() == Some(envelope.event_type.as_str());

        // Single-writer via optimistic versioning: a conflicting append
        // means another worker advanced this instance, so reload and resume
        // from the state it recorded.
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if is_cancel {
                self.advance_cancel(definition, ctx).await
            } else {
                self.advance_start(definition, ctx, envelope).await
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(error) if is_conflict(&error) && attempt < self.retry.max_conflict_retries => {
                    tracing::debug!(
                        saga_id = %ctx.stream_id,
                        attempt,
                        "lost a saga write race, reloading"
                    );
                }
                Err(error) if is_conflict(&error) => {
                    return Err(SagaError::ConflictRetriesExhausted {
                        stream_id: ctx.stream_id,
                        attempts: attempt,
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn advance_start(
        &self,
        definition: &SagaDefinition,
        ctx: SagaContext,
        envelope: &EventEnvelope,
    ) -> Result<Option<StreamId>> {
        let mut saga = self.load(ctx.stream_id).await?;

        match saga.status() {
            SagaStatus::NotStarted => {
                metrics::counter!("saga_started_total").increment(1);
                tracing::info!(
                    saga_type = definition.saga_type(),
                    saga_id = %ctx.stream_id,
                    "saga started"
                );
                let started = SagaEvent::saga_started(
                    ctx.stream_id,
                    definition.saga_type(),
                    ctx.correlation_id,
                    ctx.tenant_id,
                    envelope.payload.clone(),
                );
                self.append(ctx, &mut saga, started).await?;
                self.drive(definition, ctx, &mut saga).await?;
                Ok(Some(ctx.stream_id))
            }
            // A worker died mid-saga; pick up where its events stop.
            SagaStatus::Running => {
                self.drive(definition, ctx, &mut saga).await?;
                Ok(Some(ctx.stream_id))
            }
            SagaStatus::Compensating => {
                self.compensate(definition, ctx, &mut saga, "resume").await?;
                Ok(Some(ctx.stream_id))
            }
            // At-least-once delivery: a terminal instance has already seen
            // this trigger.
            status @ (SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed) => {
                tracing::debug!(
                    saga_id = %ctx.stream_id,
                    %status,
                    "duplicate trigger for terminal saga ignored"
                );
                Ok(None)
            }
        }
    }

    async fn advance_cancel(
        &self,
        definition: &SagaDefinition,
        ctx: SagaContext,
    ) -> Result<Option<StreamId>> {
        let mut saga = self.load(ctx.stream_id).await?;

        match saga.status() {
            SagaStatus::NotStarted => {
                tracing::debug!(saga_id = %ctx.stream_id, "cancel for unknown saga ignored");
                Ok(None)
            }
            status @ (SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed) => {
                tracing::debug!(
                    saga_id = %ctx.stream_id,
                    %status,
                    "cancel for terminal saga ignored"
                );
                Ok(None)
            }
            SagaStatus::Running => {
                // Cancelling under a live step claim would compensate while
                // the claimed action may still commit; wait for the claim to
                // settle and let redelivery carry the cancel.
                if let Some(claim) = saga.in_flight_step()
                    && self.claim_is_fresh(claim)
                {
                    tracing::debug!(
                        saga_id = %ctx.stream_id,
                        step = %claim.step_name,
                        "cancel deferred while a step is in flight"
                    );
                    return Ok(None);
                }
                tracing::info!(saga_id = %ctx.stream_id, "saga cancellation requested");
                let requested = SagaEvent::cancellation_requested(format!(
                    "cancelled by {}",
                    definition.cancelled_by().unwrap_or("cancel event")
                ));
                self.append(ctx, &mut saga, requested).await?;
                self.compensate(definition, ctx, &mut saga, "cancel").await?;
                Ok(Some(ctx.stream_id))
            }
            SagaStatus::Compensating => {
                self.compensate(definition, ctx, &mut saga, "cancel").await?;
                Ok(Some(ctx.stream_id))
            }
        }
    }

    /// Runs the forward steps that have not completed yet.
    ///
    /// Each step is claimed by appending `StepStarted` under optimistic
    /// concurrency before its action runs. A reloaded instance whose last
    /// step event is an unsettled claim belongs to another worker: as long
    /// as the claim is fresh this delivery backs off and the step is left
    /// to that worker (or to redelivery), so the action never runs twice
    /// concurrently. A stale claim is a crashed worker's leftovers and is
    /// resumed without a second `StepStarted`.
    async fn drive(
        &self,
        definition: &SagaDefinition,
        ctx: SagaContext,
        saga: &mut SagaInstance,
    ) -> Result<()> {
        for step in definition.steps() {
            if saga.completed_steps().iter().any(|s| s == step.name()) {
                continue;
            }

            match saga.in_flight_step() {
                Some(claim) if claim.step_name == step.name() && self.claim_is_fresh(claim) => {
                    tracing::debug!(
                        saga_id = %ctx.stream_id,
                        step = step.name(),
                        "step claimed by another worker, leaving it to them"
                    );
                    return Ok(());
                }
                Some(claim) if claim.step_name == step.name() => {
                    tracing::warn!(
                        saga_id = %ctx.stream_id,
                        step = step.name(),
                        claimed_at = %claim.started_at,
                        "resuming a stale step claim"
                    );
                }
                _ => {
                    tracing::info!(
                        saga_id = %ctx.stream_id,
                        step = step.name(),
                        "saga step started"
                    );
                    self.append(ctx, saga, SagaEvent::step_started(step.name()))
                        .await?;
                }
            }

            match (step.action())(saga, &self.bus).await {
                Ok(context) => {
                    self.append(ctx, saga, SagaEvent::step_completed(step.name(), context))
                        .await?;
                }
                Err(error) => {
                    tracing::warn!(
                        saga_id = %ctx.stream_id,
                        step = step.name(),
                        error = %error,
                        "saga step failed"
                    );
                    self.append(
                        ctx,
                        saga,
                        SagaEvent::step_failed(step.name(), error.to_string()),
                    )
                    .await?;
                    return self.compensate(definition, ctx, saga, step.name()).await;
                }
            }
        }

        self.append(ctx, saga, SagaEvent::saga_completed()).await?;
        metrics::counter!("saga_completed_total").increment(1);
        tracing::info!(saga_id = %ctx.stream_id, "saga completed");
        Ok(())
    }

    /// Unwinds completed steps in reverse completion order.
    ///
    /// A failing compensation is retried with backoff; when its attempts
    /// are exhausted the saga ends `Failed` rather than `Compensated` and
    /// is left for manual intervention.
    async fn compensate(
        &self,
        definition: &SagaDefinition,
        ctx: SagaContext,
        saga: &mut SagaInstance,
        from_step: &str,
    ) -> Result<()> {
        if saga.status().can_compensate() {
            self.append(ctx, saga, SagaEvent::compensation_started(from_step))
                .await?;
        }

        let pending: Vec<String> = saga
            .completed_steps()
            .iter()
            .rev()
            .filter(|s| !saga.compensated_steps().contains(s))
            .cloned()
            .collect();

        for step_name in pending {
            let Some(step) = definition.step(&step_name) else {
                continue;
            };
            let Some(compensation) = step.compensation() else {
                // Nothing to unwind; record it so a resume does not revisit.
                self.append(ctx, saga, SagaEvent::compensation_step_completed(&step_name))
                    .await?;
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                match compensation(saga, &self.bus).await {
                    Ok(()) => {
                        self.append(
                            ctx,
                            saga,
                            SagaEvent::compensation_step_completed(&step_name),
                        )
                        .await?;
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(
                            saga_id = %ctx.stream_id,
                            step = %step_name,
                            attempt,
                            error = %error,
                            "compensation attempt failed"
                        );
                        self.append(
                            ctx,
                            saga,
                            SagaEvent::compensation_step_failed(&step_name, error.to_string()),
                        )
                        .await?;

                        if attempt >= self.retry.max_compensation_attempts {
                            let reason = format!(
                                "compensation for '{}' exhausted after {} attempts: {}",
                                step_name, attempt, error
                            );
                            self.append(ctx, saga, SagaEvent::saga_failed(reason)).await?;
                            metrics::counter!("saga_failed_total").increment(1);
                            tracing::error!(
                                saga_id = %ctx.stream_id,
                                step = %step_name,
                                "saga failed, manual intervention required"
                            );
                            return Ok(());
                        }

                        let backoff = self.retry.compensation_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.append(ctx, saga, SagaEvent::saga_compensated()).await?;
        metrics::counter!("saga_compensated_total").increment(1);
        tracing::info!(saga_id = %ctx.stream_id, "saga compensated");
        Ok(())
    }

    fn claim_is_fresh(&self, claim: &InFlightStep) -> bool {
        claim.age(Utc::now()) < self.retry.step_timeout
    }

    async fn load(&self, stream_id: StreamId) -> Result<SagaInstance> {
        let events = self.store.read_to_end(stream_id, Version::initial()).await?;

        let mut saga = SagaInstance::default();
        for envelope in events {
            let event: SagaEvent = serde_json::from_value(envelope.payload)?;
            saga.apply(event);
            saga.set_version(envelope.version);
        }
        Ok(saga)
    }

    /// Appends one lifecycle event under optimistic concurrency, then
    /// applies it locally.
    async fn append(
        &self,
        ctx: SagaContext,
        saga: &mut SagaInstance,
        event: SagaEvent,
    ) -> Result<()> {
        let current = saga.version();
        let envelope = EventEnvelope::builder()
            .stream_id(ctx.stream_id)
            .aggregate_type(SagaInstance::aggregate_type())
            .event_type(event.event_type())
            .version(current.next())
            .payload(&event)?
            .metadata(
                EventMetadata::correlated(ctx.tenant_id, ctx.correlation_id)
                    .caused_by(ctx.causation_id),
            )
            .build();

        let options = if current == Version::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_version(current)
        };

        let new_version = self.store.append(vec![envelope], options).await?;
        saga.apply(event);
        saga.set_version(new_version);
        Ok(())
    }
}

fn is_conflict(error: &SagaError) -> bool {
    matches!(error, SagaError::EventStore(e) if e.is_concurrency_conflict())
}

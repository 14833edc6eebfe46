//! Event-sourced aggregate repository.

use std::marker::PhantomData;

use common::{CorrelationId, StreamId, TenantId};
use event_store::{
    AppendOptions, EventEnvelope, EventId, EventMetadata, EventStore, EventStoreExt, Snapshot,
    Version,
};
use serde::Serialize;

use crate::aggregate::{Aggregate, DomainEvent, SnapshotCapable};
use crate::error::DomainError;

/// Caller-supplied context stamped onto every event a command produces.
///
/// The tenant id arrives with every command; the correlation id ties the
/// events to the originating business operation; the causation id points at
/// the event that triggered this command, if any.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
}

impl CommandContext {
    /// Creates a context for a fresh business operation.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            correlation_id: CorrelationId::new(),
            causation_id: None,
        }
    }

    /// Creates a context continuing an existing operation.
    pub fn correlated(tenant_id: TenantId, correlation_id: CorrelationId) -> Self {
        Self {
            tenant_id,
            correlation_id,
            causation_id: None,
        }
    }

    /// Returns a copy with the causation id set.
    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }

    fn metadata(&self) -> EventMetadata {
        let metadata = EventMetadata::correlated(self.tenant_id, self.correlation_id);
        match self.causation_id {
            Some(id) => metadata.caused_by(id),
            None => metadata,
        }
    }
}

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    pub events: Vec<A::Event>,

    /// The new version of the aggregate after the command.
    pub new_version: Version,
}

/// Loads and persists event-sourced aggregates.
///
/// The repository is responsible for:
/// 1. Loading the aggregate from the event store (nearest snapshot + replay)
/// 2. Executing the command to produce events
/// 3. Persisting the events (and their outbox rows) atomically under
///    optimistic concurrency
/// 4. Optionally saving a snapshot
pub struct AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> AggregateRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new repository backed by the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from the event store.
    ///
    /// Replays from the nearest snapshot when one exists; the result is
    /// identical to a full replay from version zero. If the aggregate
    /// doesn't exist, returns a default instance at version 0.
    pub async fn load(&self, stream_id: StreamId) -> Result<A, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: for<'de> serde::Deserialize<'de>,
    {
        let (snapshot, events) = self.store.load_for_replay(stream_id).await?;

        let mut aggregate = if let Some(snapshot) = snapshot {
            let version = snapshot.version;
            let mut restored = self.restore_from_snapshot(snapshot)?;
            restored.set_version(version);
            restored
        } else {
            A::default()
        };

        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, stream_id: StreamId) -> Result<Option<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: for<'de> serde::Deserialize<'de>,
    {
        let aggregate = self.load(stream_id).await?;
        if aggregate.stream_id().is_some() {
            Ok(Some(aggregate))
        } else {
            Ok(None)
        }
    }

    /// Loads an aggregate that must already exist.
    pub async fn load_required(&self, stream_id: StreamId) -> Result<A, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: for<'de> serde::Deserialize<'de>,
    {
        self.load_existing(stream_id)
            .await?
            .ok_or(DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                stream_id,
            })
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The command function receives the current aggregate state and returns
    /// either a list of events to apply, or an error. On
    /// `ConcurrencyConflict` the caller reloads and retries; nothing is
    /// partially applied.
    #[tracing::instrument(skip(self, ctx, command_fn), fields(aggregate_type = A::aggregate_type()))]
    pub async fn execute<F>(
        &self,
        stream_id: StreamId,
        ctx: &CommandContext,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: for<'de> serde::Deserialize<'de> + Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut aggregate = self.load(stream_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = self.build_envelopes(stream_id, current_version, ctx, &events)?;

        // First-writer-wins: a concurrent writer makes this fail with
        // ConcurrencyConflict instead of silently interleaving.
        let options = if current_version == Version::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_version(current_version)
        };

        let new_version = self.store.append(envelopes, options).await?;
        metrics::counter!("aggregate_commands_total").increment(1);

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    /// Builds event envelopes from domain events.
    fn build_envelopes(
        &self,
        stream_id: StreamId,
        current_version: Version,
        ctx: &CommandContext,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError>
    where
        A::Event: Serialize,
    {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version = version.next();
            let envelope = EventEnvelope::builder()
                .stream_id(stream_id)
                .aggregate_type(A::aggregate_type())
                .event_type(event.event_type())
                .version(version)
                .payload(event)?
                .metadata(ctx.metadata())
                .build();
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }

    fn restore_from_snapshot(&self, snapshot: Snapshot) -> Result<A, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
    {
        let aggregate: A = serde_json::from_value(snapshot.state)?;
        Ok(aggregate)
    }
}

impl<S, A> AggregateRepository<S, A>
where
    S: EventStore,
    A: SnapshotCapable,
{
    /// Executes a command and saves a snapshot when the interval is reached.
    pub async fn execute_with_snapshot<F>(
        &self,
        stream_id: StreamId,
        ctx: &CommandContext,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        A: for<'de> serde::Deserialize<'de>,
        A::Event: for<'de> serde::Deserialize<'de> + Serialize,
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let result = self.execute(stream_id, ctx, command_fn).await?;

        if result.aggregate.should_snapshot() {
            let snapshot = Snapshot::from_state(
                stream_id,
                A::aggregate_type(),
                result.new_version,
                &result.aggregate,
            )?;
            self.store.save_snapshot(snapshot).await?;
        }

        Ok(result)
    }
}

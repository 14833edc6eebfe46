//! The outbox polling loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::StreamId;
use event_store::{OutboxRecord, OutboxStore};
use tokio::sync::{Notify, watch};

use crate::broker::{BrokerMessage, MessageBroker};
use crate::error::Result;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the outbox is polled when nothing wakes the relay early.
    pub poll_interval: Duration,

    /// Maximum number of rows fetched per drain pass.
    pub batch_size: usize,

    /// Backoff after the first failed publish; doubles per attempt.
    pub base_backoff: chrono::Duration,

    /// Upper bound on the backoff.
    pub max_backoff: chrono::Duration,

    /// Attempts after which a row is flagged stuck and needs an operator.
    pub max_attempts: i32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            base_backoff: chrono::Duration::seconds(1),
            max_backoff: chrono::Duration::minutes(5),
            max_attempts: 10,
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub dispatched: usize,
    pub failed: usize,

    /// Rows skipped because an earlier row of the same stream failed this
    /// pass. Skipping keeps per-stream order intact.
    pub skipped: usize,
}

/// Polls the outbox and publishes undispatched rows to the broker.
pub struct OutboxRelay<S, B> {
    store: S,
    broker: B,
    config: RelayConfig,
    wake: Arc<Notify>,
}

impl<S, B> OutboxRelay<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    pub fn new(store: S, broker: B, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle a writer can use to nudge the relay right after a commit,
    /// instead of waiting for the next poll tick.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    fn backoff_after(&self, attempts: i32) -> chrono::Duration {
        // attempts is the count including the failure just recorded, so the
        // first retry waits base_backoff, the second twice that, and so on.
        let exponent = (attempts - 1).clamp(0, 16) as u32;
        let backoff = self.config.base_backoff * 2_i32.pow(exponent);
        backoff.min(self.config.max_backoff)
    }

    /// Runs one drain pass over the outbox.
    ///
    /// Rows are processed in creation order. When a publish fails, the rest
    /// of that stream's rows are skipped for this pass; other streams are
    /// unaffected. Failed rows are never dropped: they back off, and after
    /// `max_attempts` they are flagged stuck for an operator to inspect.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainStats> {
        let records = self.store.undispatched(self.config.batch_size).await?;
        let mut stats = DrainStats::default();
        let mut failed_streams: HashSet<StreamId> = HashSet::new();

        for record in records {
            if failed_streams.contains(&record.stream_id) {
                stats.skipped += 1;
                continue;
            }

            match self.broker.publish(BrokerMessage::from_outbox(&record)).await {
                Ok(()) => {
                    self.store.mark_dispatched(record.id).await?;
                    stats.dispatched += 1;
                }
                Err(error) => {
                    self.handle_publish_failure(&record, &*error).await?;
                    failed_streams.insert(record.stream_id);
                    stats.failed += 1;
                }
            }
        }

        if stats.dispatched > 0 {
            metrics::counter!("outbox_dispatched_total").increment(stats.dispatched as u64);
        }
        if stats.failed > 0 {
            metrics::counter!("outbox_dispatch_failures_total").increment(stats.failed as u64);
        }

        Ok(stats)
    }

    async fn handle_publish_failure(
        &self,
        record: &OutboxRecord,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> Result<()> {
        let message = error.to_string();
        let next_attempt_at = Utc::now() + self.backoff_after(record.attempts + 1);
        let attempts = self
            .store
            .record_failure(record.id, &message, next_attempt_at)
            .await?;

        tracing::warn!(
            outbox_id = %record.id,
            stream_id = %record.stream_id,
            event_type = %record.event_type,
            attempts,
            error = %message,
            "publish failed, backing off"
        );

        if attempts >= self.config.max_attempts {
            self.store.mark_stuck(record.id).await?;
            metrics::counter!("outbox_stuck_total").increment(1);
            tracing::error!(
                outbox_id = %record.id,
                stream_id = %record.stream_id,
                attempts,
                "outbox row exhausted its attempts and is flagged stuck"
            );
        }

        Ok(())
    }

    /// Runs the relay until the shutdown signal flips to true.
    ///
    /// Drains on every poll tick and whenever the waker is nudged. Store
    /// errors are logged and the loop keeps going; the outbox itself holds
    /// the rows, so nothing is lost across a bad pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("outbox relay shutting down");
                        return;
                    }
                    continue;
                }
            }

            if let Err(error) = self.drain_once().await {
                tracing::error!(%error, "outbox drain pass failed");
            }
        }
    }
}

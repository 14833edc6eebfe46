//! Saga event-consumption worker.

use std::sync::Arc;

use event_store::{EventEnvelope, EventStore};
use tokio::sync::{mpsc, watch};

use crate::orchestrator::SagaOrchestrator;

/// Consumes events from one partition and feeds them to the orchestrator.
///
/// Events arrive partitioned by stream id, so a single worker sees one
/// stream's events in order. A handling error is logged and the worker
/// keeps going: the orchestrator's own version discipline means a lost or
/// failed delivery is recovered on the next delivery of the same event,
/// and one saga's failure never takes the worker down.
pub async fn run_partition_worker<S>(
    orchestrator: Arc<SagaOrchestrator<S>>,
    mut events: mpsc::Receiver<EventEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: EventStore,
{
    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else {
                    tracing::info!("saga worker input closed, stopping");
                    return;
                };
                if let Err(error) = orchestrator.handle_event(&envelope).await {
                    tracing::error!(
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        %error,
                        "saga event handling failed, awaiting redelivery"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("saga worker shutting down");
                    return;
                }
            }
        }
    }
}

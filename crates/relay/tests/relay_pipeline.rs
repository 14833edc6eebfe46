//! End-to-end relay pipeline tests over the in-memory store and broker.

use std::time::Duration;

use common::StreamId;
use event_store::{
    AppendOptions, EventEnvelope, EventMetadata, EventStore, InMemoryEventStore, TenantId, Version,
};
use relay::{InMemoryBroker, OutboxRelay, RelayConfig};
use tokio::sync::watch;

fn test_event(stream_id: StreamId, version: Version, event_type: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .stream_id(stream_id)
        .aggregate_type("Order")
        .event_type(event_type)
        .version(version)
        .payload_raw(serde_json::json!({"v": version.as_i64()}))
        .metadata(EventMetadata::new(TenantId::new()))
        .build()
}

#[tokio::test]
async fn relay_loop_drains_committed_events_until_shutdown() {
    let store = InMemoryEventStore::new();
    let broker = InMemoryBroker::new();
    let config = RelayConfig {
        poll_interval: Duration::from_millis(10),
        ..RelayConfig::default()
    };
    let relay = std::sync::Arc::new(OutboxRelay::new(store.clone(), broker.clone(), config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let waker = relay.waker();
    let worker = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run(shutdown_rx).await })
    };

    let stream = StreamId::new();
    store
        .append(
            vec![
                test_event(stream, Version::new(1), "OrderPlaced"),
                test_event(stream, Version::new(2), "OrderPaid"),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    waker.notify_one();

    // Wait for the relay to pick the rows up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while broker.total_published().await < 2 {
        assert!(tokio::time::Instant::now() < deadline, "relay never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let log = broker.partition(stream).await;
    assert_eq!(log[0].event_type, "OrderPlaced");
    assert_eq!(log[1].event_type, "OrderPaid");

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn restart_after_partial_dispatch_resumes_where_it_left_off() {
    let store = InMemoryEventStore::new();
    let broker = InMemoryBroker::new();
    let stream = StreamId::new();

    store
        .append(
            vec![
                test_event(stream, Version::new(1), "OrderPlaced"),
                test_event(stream, Version::new(2), "OrderPaid"),
                test_event(stream, Version::new(3), "OrderShipped"),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    // First relay dispatches one row, then "crashes".
    let first = OutboxRelay::new(
        store.clone(),
        broker.clone(),
        RelayConfig {
            batch_size: 1,
            ..RelayConfig::default()
        },
    );
    first.drain_once().await.unwrap();
    drop(first);

    // A fresh relay over the same outbox picks up the remaining rows; the
    // partition log still reads in stream order.
    let second = OutboxRelay::new(store.clone(), broker.clone(), RelayConfig::default());
    let stats = second.drain_once().await.unwrap();
    assert_eq!(stats.dispatched, 2);

    let types: Vec<_> = broker
        .partition(stream)
        .await
        .iter()
        .map(|m| m.event_type.clone())
        .collect();
    assert_eq!(types, ["OrderPlaced", "OrderPaid", "OrderShipped"]);
}

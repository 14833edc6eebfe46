use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{
    AppendOptions, EventEnvelope, EventMetadata, EventStoreExt, InMemoryEventStore, StreamId,
    TenantId, Version, store::EventStore,
};

fn make_event(stream_id: StreamId, version: i64) -> EventEnvelope {
    EventEnvelope::builder()
        .stream_id(stream_id)
        .aggregate_type("Order")
        .event_type("OrderPlaced")
        .version(Version::new(version))
        .payload_raw(serde_json::json!({
            "type": "OrderPlaced",
            "data": {
                "order_id": stream_id.to_string(),
                "customer_id": "00000000-0000-0000-0000-000000000001"
            }
        }))
        .metadata(EventMetadata::new(TenantId::from_uuid(uuid::Uuid::nil())))
        .build()
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream_id = StreamId::new();
                let event = make_event(stream_id, 1);
                store
                    .append(vec![event], AppendOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream_id = StreamId::new();
                let events: Vec<EventEnvelope> =
                    (1..=10).map(|v| make_event(stream_id, v)).collect();
                store.append(events, AppendOptions::new()).await.unwrap();
            });
        });
    });
}

fn bench_append_with_version_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_with_version_check", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let stream_id = StreamId::new();
                let event = make_event(stream_id, 1);
                store
                    .append(vec![event], AppendOptions::expect_new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_read_stream_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let stream_id = StreamId::new();

    // Pre-populate with 100 events
    rt.block_on(async {
        let events: Vec<EventEnvelope> = (1..=100).map(|v| make_event(stream_id, v)).collect();
        store.append(events, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("event_store/read_stream_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .read_to_end(stream_id, Version::initial())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_replay_from_snapshot_point(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let stream_id = StreamId::new();

    // Pre-populate with 100 events
    rt.block_on(async {
        let events: Vec<EventEnvelope> = (1..=100).map(|v| make_event(stream_id, v)).collect();
        store.append(events, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("event_store/read_stream_from_version_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.read_to_end(stream_id, Version::new(50)).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_append_with_version_check,
    bench_read_stream_100,
    bench_replay_from_snapshot_point,
);
criterion_main!(benches);

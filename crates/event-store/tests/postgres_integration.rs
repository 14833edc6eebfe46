//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency and need a
//! local Docker daemon, so they are ignored by default. Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use event_store::{
    AppendOptions, EventEnvelope, EventMetadata, EventStore, EventStoreError, EventStoreExt,
    OutboxRecordId, OutboxStore, PostgresEventStore, Snapshot, StreamId, TenantId, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!("../../../migrations/001_create_core_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE events, snapshots, outbox, idempotency_keys")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(stream_id: StreamId, version: Version, event_type: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .stream_id(stream_id)
        .aggregate_type("TestAggregate")
        .event_type(event_type)
        .version(version)
        .payload_raw(serde_json::json!({"test": true}))
        .metadata(EventMetadata::new(TenantId::new()))
        .build()
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn append_and_read_roundtrip() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let events = vec![
        create_test_event(stream_id, Version::new(1), "Event1"),
        create_test_event(stream_id, Version::new(2), "Event2"),
    ];
    let version = store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();
    assert_eq!(version, Version::new(2));

    let stored = store
        .read_to_end(stream_id, Version::initial())
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].event_type, "Event1");
    assert_eq!(stored[1].version, Version::new(2));
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn stale_expected_version_conflicts() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let event = create_test_event(stream_id, Version::first(), "Event1");
    store
        .append(vec![event], AppendOptions::expect_new())
        .await
        .unwrap();

    let stale = create_test_event(stream_id, Version::first(), "Event2");
    let result = store.append(vec![stale], AppendOptions::expect_new()).await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));

    let stored = store
        .read_to_end(stream_id, Version::initial())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn unique_constraint_caught_without_expected_version() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let event = create_test_event(stream_id, Version::first(), "Event1");
    store
        .append(vec![event], AppendOptions::new())
        .await
        .unwrap();

    // Same (stream, version) without the read-check path: the unique
    // constraint is the last line of defense.
    let duplicate = create_test_event(stream_id, Version::first(), "Event2");
    let result = store.append(vec![duplicate], AppendOptions::new()).await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn append_commits_outbox_rows_in_same_transaction() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let events = vec![
        create_test_event(stream_id, Version::new(1), "OrderPlaced"),
        create_test_event(stream_id, Version::new(2), "OrderShipped"),
    ];
    store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();

    // A relay restarting after a crash re-scans this exact query.
    let rows = store.undispatched(10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].event_type, "OrderPlaced");
    assert_eq!(rows[1].event_type, "OrderShipped");

    store.mark_dispatched(rows[0].id).await.unwrap();
    let remaining = store.undispatched(10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].event_type, "OrderShipped");
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn snapshot_upsert_and_validation() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let events = vec![
        create_test_event(stream_id, Version::new(1), "Event1"),
        create_test_event(stream_id, Version::new(2), "Event2"),
    ];
    store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();

    let snapshot = Snapshot::new(
        stream_id,
        "TestAggregate",
        Version::new(2),
        serde_json::json!({"value": 2}),
    );
    store.save_snapshot(snapshot).await.unwrap();

    let retrieved = store.get_snapshot(stream_id).await.unwrap().unwrap();
    assert_eq!(retrieved.version, Version::new(2));

    // A snapshot for a version with no event is rejected.
    let bad = Snapshot::new(
        stream_id,
        "TestAggregate",
        Version::new(9),
        serde_json::json!({}),
    );
    assert!(matches!(
        store.save_snapshot(bad).await,
        Err(EventStoreError::InvalidSnapshotVersion { .. })
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires a local Docker daemon"]
async fn outbox_failure_bookkeeping() {
    let store = get_test_store().await;
    let stream_id = StreamId::new();

    let event = create_test_event(stream_id, Version::first(), "Event1");
    store
        .append(vec![event], AppendOptions::expect_new())
        .await
        .unwrap();

    let rows = store.undispatched(10).await.unwrap();
    let id = rows[0].id;

    let attempts = store
        .record_failure(id, "broker down", chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(attempts, 1);

    store.mark_stuck(id).await.unwrap();
    assert!(store.undispatched(10).await.unwrap().is_empty());
    assert_eq!(store.stuck_count().await.unwrap(), 1);

    // A purged or never-written id is a no-op, not an error.
    let attempts = store
        .record_failure(OutboxRecordId::new(), "broker down", chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(attempts, 0);
}

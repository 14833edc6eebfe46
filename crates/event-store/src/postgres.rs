use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CURRENT_SCHEMA_VERSION, EventEnvelope, EventId, EventMetadata, EventStoreError, Result,
    Snapshot, StreamId, Version,
    outbox::{OutboxRecord, OutboxRecordId, OutboxStore},
    store::{AppendOptions, EventStore, EventStream, validate_events_for_append},
};

/// PostgreSQL-backed event store implementation.
///
/// Events and their outbox rows are written in one transaction, so the log
/// and the outbox can never diverge.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let schema_version: i32 = row.try_get("schema_version")?;
        let schema_version = schema_version as u16;
        let event_id: Uuid = row.try_get("id")?;

        if schema_version > CURRENT_SCHEMA_VERSION {
            return Err(EventStoreError::SchemaVersionMismatch {
                event_id,
                stored: schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: EventMetadata = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(event_id),
            event_type: row.try_get("event_type")?,
            stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
            schema_version,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: OutboxRecordId::from_uuid(row.try_get::<Uuid, _>("id")?),
            stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            stuck: row.try_get("stuck")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let first_event = &events[0];
        let stream_id = first_event.stream_id;

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_version {
            let current_version: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                    .bind(stream_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await?;

            let actual = Version::new(current_version.unwrap_or(0));

            if actual != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last_version = Version::initial();
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, event_type, stream_id, aggregate_type, version, timestamp, payload, metadata, schema_version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.stream_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.version.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(&metadata_json)
            .bind(event.schema_version as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // Unique constraint violation means a concurrent writer won.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected: options.expected_version.unwrap_or(Version::initial()),
                        actual: event.version,
                    };
                }
                EventStoreError::StorageUnavailable(e)
            })?;

            // Outbox row in the same transaction: the log and the outbox
            // commit or roll back together.
            let outbox = OutboxRecord::for_event(event)?;
            sqlx::query(
                r#"
                INSERT INTO outbox (id, stream_id, event_id, event_type, payload, metadata, created_at, next_attempt_at, attempts, stuck)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, FALSE)
                "#,
            )
            .bind(outbox.id.as_uuid())
            .bind(outbox.stream_id.as_uuid())
            .bind(outbox.event_id.as_uuid())
            .bind(&outbox.event_type)
            .bind(&outbox.payload)
            .bind(&outbox.metadata)
            .bind(outbox.created_at)
            .bind(outbox.next_attempt_at)
            .execute(&mut *tx)
            .await?;

            last_version = event.version;
        }

        tx.commit().await?;
        metrics::counter!("events_appended_total").increment(events.len() as u64);
        Ok(last_version)
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<EventStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT id, event_type, stream_id, aggregate_type, version, timestamp, payload, metadata, schema_version
            FROM events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .bind(from_version.as_i64())
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_event(row),
            Err(e) => Err(EventStoreError::StorageUnavailable(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let current = self
            .stream_version(snapshot.stream_id)
            .await?
            .unwrap_or(Version::initial());
        if snapshot.version > current || snapshot.version == Version::initial() {
            return Err(EventStoreError::InvalidSnapshotVersion {
                stream_id: snapshot.stream_id,
                version: snapshot.version,
                current,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO snapshots (stream_id, aggregate_type, version, timestamp, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_id) DO UPDATE SET
                aggregate_type = EXCLUDED.aggregate_type,
                version = EXCLUDED.version,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.stream_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, stream_id: StreamId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT stream_id, aggregate_type, version, timestamp, state
            FROM snapshots
            WHERE stream_id = $1
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresEventStore {
    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stream_id, event_id, event_type, payload, metadata, created_at, dispatched_at, attempts, next_attempt_at, stuck, last_error
            FROM outbox
            WHERE dispatched_at IS NULL AND stuck = FALSE AND next_attempt_at <= NOW()
            ORDER BY position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, id: OutboxRecordId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET dispatched_at = NOW(), attempts = attempts + 1, last_error = NULL WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: OutboxRecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await?;
        // An unknown id is a no-op, matching the in-memory store.
        Ok(attempts.unwrap_or(0))
    }

    async fn mark_stuck(&self, id: OutboxRecordId) -> Result<()> {
        sqlx::query("UPDATE outbox SET stuck = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stuck_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE stuck = TRUE")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE dispatched_at IS NOT NULL AND dispatched_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

//! PostgreSQL-backed idempotency store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::error::Result;
use crate::store::{BeginOutcome, IdempotencyStatus, IdempotencyStore, KeyRecord};

/// Idempotency store backed by the `idempotency_keys` table.
///
/// Acquisition relies on the primary key: a conflict-free insert decides the
/// single winner, and a conditional update reclaims failed or expired
/// records so only one of several racing re-attempters proceeds.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drops expired terminal records.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM idempotency_keys WHERE expires_at IS NOT NULL AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    fn row_to_record(row: PgRow) -> Result<KeyRecord> {
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "pending" => IdempotencyStatus::Pending,
            "completed" => IdempotencyStatus::Completed,
            _ => IdempotencyStatus::Failed,
        };

        Ok(KeyRecord {
            key: row.try_get("key")?,
            status,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<KeyRecord>> {
        let row = sqlx::query(
            "SELECT key, status, result, error, created_at, expires_at FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<BeginOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, status, created_at)
            VALUES ($1, 'pending', $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            metrics::counter!("idempotency_keys_acquired_total").increment(1);
            return Ok(BeginOutcome::Acquired);
        }

        // The key exists. Failed and expired records count as absent, but
        // reclaiming them must itself be single-winner, so the reset is a
        // conditional update rather than a read-then-write.
        let reclaimed = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'pending', result = NULL, error = NULL, created_at = $2, expires_at = NULL
            WHERE key = $1
              AND (status = 'failed' OR (expires_at IS NOT NULL AND expires_at <= $2))
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if reclaimed.rows_affected() == 1 {
            metrics::counter!("idempotency_keys_acquired_total").increment(1);
            return Ok(BeginOutcome::Acquired);
        }

        match self.fetch(key).await? {
            Some(record) if record.status == IdempotencyStatus::Completed => {
                metrics::counter!("idempotency_replays_total").increment(1);
                Ok(BeginOutcome::Completed(
                    record.result.unwrap_or(serde_json::Value::Null),
                ))
            }
            // Pending, or the record changed hands between our update and
            // this read. Either way another caller holds the key now.
            _ => Ok(BeginOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        key: &str,
        result: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed', result = $2, error = NULL, expires_at = $3
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(&result)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'failed', error = $2, result = NULL, expires_at = $3
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(error)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<KeyRecord>> {
        let record = self.fetch(key).await?;
        Ok(record.filter(|r| !r.is_expired(now)))
    }
}

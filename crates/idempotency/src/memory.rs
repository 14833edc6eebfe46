//! In-memory idempotency store for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::{BeginOutcome, IdempotencyStatus, IdempotencyStore, KeyRecord};

/// Mutex-backed idempotency store.
///
/// The single lock gives the same single-winner acquisition semantics as the
/// Postgres implementation's conflict-free insert.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, KeyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records currently held, expired ones included.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Drops expired terminal records.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }
}

fn pending_record(key: &str, now: DateTime<Utc>) -> KeyRecord {
    KeyRecord {
        key: key.to_string(),
        status: IdempotencyStatus::Pending,
        result: None,
        error: None,
        created_at: now,
        expires_at: None,
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<BeginOutcome> {
        let mut records = self.records.lock().await;

        match records.get(key) {
            None => {
                records.insert(key.to_string(), pending_record(key, now));
                Ok(BeginOutcome::Acquired)
            }
            Some(record) if record.status == IdempotencyStatus::Pending => {
                Ok(BeginOutcome::InFlight)
            }
            // Expired terminal records and failed records count as absent:
            // the caller re-attempts the operation.
            Some(record)
                if record.is_expired(now) || record.status == IdempotencyStatus::Failed =>
            {
                records.insert(key.to_string(), pending_record(key, now));
                Ok(BeginOutcome::Acquired)
            }
            Some(record) => Ok(BeginOutcome::Completed(
                record.result.clone().unwrap_or(serde_json::Value::Null),
            )),
        }
    }

    async fn complete(
        &self,
        key: &str,
        result: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(key) {
            record.status = IdempotencyStatus::Completed;
            record.result = Some(result);
            record.error = None;
            record.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(key) {
            record.status = IdempotencyStatus::Failed;
            record.error = Some(error.to_string());
            record.result = None;
            record.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<KeyRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }
}

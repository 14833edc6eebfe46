//! Storage abstraction for idempotency records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The operation is running; the key is held.
    Pending,

    /// The operation succeeded and its result is recorded.
    Completed,

    /// The operation failed. The record documents the failure but does not
    /// block a later re-attempt.
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }
}

/// A stored idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub status: IdempotencyStatus,

    /// The recorded result, present when status is `Completed`.
    pub result: Option<serde_json::Value>,

    /// The recorded failure, present when status is `Failed`.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// When this record stops being authoritative. Only terminal records
    /// carry an expiry; a pending record never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    /// Returns true if the record's retention window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Outcome of attempting to acquire a key.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// The caller won the key and must run the operation.
    Acquired,

    /// Another caller holds the key and has not finished.
    InFlight,

    /// The operation already completed; the recorded result is returned.
    Completed(serde_json::Value),
}

/// Storage backend for idempotency records.
///
/// `begin` must be single-winner: when several callers race on an absent
/// key, exactly one observes `Acquired`. A `Failed` or expired terminal
/// record counts as absent, so the winner re-attempts the operation.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempts to acquire the key, creating a pending record on success.
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<BeginOutcome>;

    /// Records a successful result against a pending key.
    async fn complete(
        &self,
        key: &str,
        result: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Records a failure against a pending key.
    async fn fail(&self, key: &str, error: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Fetches the record for a key, if any unexpired record exists.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<KeyRecord>>;
}

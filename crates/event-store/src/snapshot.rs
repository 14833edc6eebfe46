use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{StreamId, Version};

/// A snapshot of an aggregate's state at a specific version.
///
/// Snapshots are a pure optimization: replaying the events after a snapshot
/// must reconstruct state identical to a full replay from version zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The stream this snapshot belongs to.
    pub stream_id: StreamId,

    /// The type of aggregate (e.g., "Order", "Invoice").
    pub aggregate_type: String,

    /// The version of the aggregate at the time of the snapshot.
    pub version: Version,

    /// When the snapshot was created.
    pub timestamp: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        stream_id: StreamId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self {
            stream_id,
            aggregate_type: aggregate_type.into(),
            version,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        stream_id: StreamId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            stream_id,
            aggregate_type: aggregate_type.into(),
            version,
            timestamp: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Gets a reference to the state as JSON.
    pub fn state_ref(&self) -> &serde_json::Value {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct InvoiceState {
        outstanding_cents: i64,
        customer: String,
    }

    #[test]
    fn snapshot_new() {
        let id = StreamId::new();
        let state = serde_json::json!({"outstanding_cents": 12_00});

        let snapshot = Snapshot::new(id, "Invoice", Version::new(5), state.clone());

        assert_eq!(snapshot.stream_id, id);
        assert_eq!(snapshot.aggregate_type, "Invoice");
        assert_eq!(snapshot.version, Version::new(5));
        assert_eq!(snapshot.state, state);
    }

    #[test]
    fn snapshot_from_state_and_into_state() {
        let id = StreamId::new();
        let original = InvoiceState {
            outstanding_cents: 12_00,
            customer: "acme".to_string(),
        };

        let snapshot = Snapshot::from_state(id, "Invoice", Version::new(5), &original).unwrap();

        let restored: InvoiceState = snapshot.into_state().unwrap();
        assert_eq!(restored, original);
    }
}

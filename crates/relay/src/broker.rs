//! Message broker abstraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::StreamId;
use event_store::OutboxRecord;
use tokio::sync::Mutex;

/// A message handed to the broker.
///
/// The partition key is the originating stream id, so brokers that preserve
/// order within a partition preserve per-stream event order end to end.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub partition_key: StreamId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl BrokerMessage {
    /// Builds a broker message from an outbox row.
    pub fn from_outbox(record: &OutboxRecord) -> Self {
        Self {
            partition_key: record.stream_id,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
        }
    }
}

/// Publishes messages to an external broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(
        &self,
        message: BrokerMessage,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// In-memory broker for tests and local development.
///
/// Keeps one ordered log per partition and can be toggled to reject every
/// publish, which is how broker outages are simulated in tests.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    partitions: Arc<Mutex<HashMap<StreamId, Vec<BrokerMessage>>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail (or succeed again).
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns the messages published to one partition, in publish order.
    pub async fn partition(&self, stream_id: StreamId) -> Vec<BrokerMessage> {
        self.partitions
            .lock()
            .await
            .get(&stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the total number of messages published across partitions.
    pub async fn total_published(&self) -> usize {
        self.partitions.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        message: BrokerMessage,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err("broker unavailable".into());
        }

        self.partitions
            .lock()
            .await
            .entry(message.partition_key)
            .or_default()
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(partition_key: StreamId, event_type: &str) -> BrokerMessage {
        BrokerMessage {
            partition_key,
            event_type: event_type.to_string(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_publish_appends_to_partition_log() {
        let broker = InMemoryBroker::new();
        let stream = StreamId::new();

        broker.publish(message(stream, "A")).await.unwrap();
        broker.publish(message(stream, "B")).await.unwrap();

        let log = broker.partition(stream).await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_type, "A");
        assert_eq!(log[1].event_type, "B");
    }

    #[tokio::test]
    async fn test_fail_toggle_rejects_publishes() {
        let broker = InMemoryBroker::new();
        broker.set_fail_on_publish(true);

        let result = broker.publish(message(StreamId::new(), "A")).await;
        assert!(result.is_err());
        assert_eq!(broker.total_published().await, 0);

        broker.set_fail_on_publish(false);
        broker.publish(message(StreamId::new(), "A")).await.unwrap();
        assert_eq!(broker.total_published().await, 1);
    }
}

//! Dead-letter sinks for poison records.
//!
//! A poison record is acknowledged so it stops blocking its partition. If
//! a [`DeadLetterSink`] is configured it gets a copy first; otherwise the
//! record is dropped with a logged error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{BrokerProducer, Offset, PartitionId, Record};
use crate::envelope::Envelope;

/// A poison record plus why it was rejected.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<String>,
    /// Raw bytes exactly as received.
    pub payload: Vec<u8>,
    /// The decoded envelope, when decoding got that far.
    pub envelope: Option<Envelope>,
    pub reason: String,
}

impl DeadLetter {
    pub fn new(record: &Record, envelope: Option<Envelope>, reason: impl Into<String>) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            envelope,
            reason: reason.into(),
        }
    }
}

/// Receives poison records. Fire-and-forget: failures are the sink's own
/// business and never reach the dispatcher.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, dead_letter: DeadLetter);
}

/// Republishes poison records, unchanged, to a dedicated topic.
pub struct BrokerDeadLetterSink {
    producer: Arc<dyn BrokerProducer>,
    topic: String,
}

impl BrokerDeadLetterSink {
    pub fn new(producer: Arc<dyn BrokerProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn record(&self, dead_letter: DeadLetter) {
        // Keyless records still need a partition key; keep them together.
        let key = dead_letter.key.as_deref().unwrap_or("");
        match self
            .producer
            .send(&self.topic, key, dead_letter.payload.clone())
            .await
        {
            Ok(meta) => tracing::info!(
                dead_letter_topic = %self.topic,
                source_topic = %dead_letter.topic,
                source_partition = dead_letter.partition,
                source_offset = dead_letter.offset,
                partition = meta.partition,
                offset = meta.offset,
                reason = %dead_letter.reason,
                "Poison record dead-lettered",
            ),
            Err(e) => tracing::error!(
                dead_letter_topic = %self.topic,
                source_topic = %dead_letter.topic,
                source_partition = dead_letter.partition,
                source_offset = dead_letter.offset,
                reason = %dead_letter.reason,
                error = %e,
                "Failed to dead-letter poison record; dropping it",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn record() -> Record {
        Record {
            topic: "user-events".into(),
            partition: 1,
            offset: 7,
            key: Some("42".into()),
            payload: b"garbage".to_vec(),
        }
    }

    #[tokio::test]
    async fn republishes_raw_payload_to_dead_letter_topic() {
        let broker = InMemoryBroker::default();
        let sink = BrokerDeadLetterSink::new(Arc::new(broker.clone()), "user-events.dlq");

        sink.record(DeadLetter::new(&record(), None, "malformed"))
            .await;

        let dead = broker.records("user-events.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"garbage");
        assert_eq!(dead[0].key.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn broker_failure_is_swallowed() {
        let broker = InMemoryBroker::default();
        broker.set_available(false);
        let sink = BrokerDeadLetterSink::new(Arc::new(broker.clone()), "user-events.dlq");

        sink.record(DeadLetter::new(&record(), None, "malformed"))
            .await;

        assert!(broker.records("user-events.dlq").is_empty());
    }
}

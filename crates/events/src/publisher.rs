//! Best-effort event publishing.
//!
//! [`EventPublisher`] is called by the primary service *after* its own
//! state change is committed. One send attempt is made, bounded by a
//! timeout; whatever happens, the caller gets a [`PublishOutcome`] rather
//! than an error, because a lost notification must never undo or block
//! the change that triggered it. Redelivery is the broker's job once the
//! record has been accepted.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::{BrokerError, BrokerProducer, RecordMetadata};
use crate::config::PublisherConfig;
use crate::envelope::{Envelope, EnvelopeError, EventType, Payload};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a publish did not reach the broker.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("broker did not confirm the send within {0:?}")]
    Timeout(Duration),
}

/// Result of a publish, from the primary service's point of view.
///
/// Neither variant is fatal; [`Warning`](PublishOutcome::Warning) is
/// already logged and only needs to be surfaced, not handled.
#[derive(Debug)]
#[must_use]
pub enum PublishOutcome {
    Published(RecordMetadata),
    Warning(PublishError),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published(_))
    }

    pub fn metadata(&self) -> Option<&RecordMetadata> {
        match self {
            PublishOutcome::Published(meta) => Some(meta),
            PublishOutcome::Warning(_) => None,
        }
    }

    pub fn warning(&self) -> Option<&PublishError> {
        match self {
            PublishOutcome::Published(_) => None,
            PublishOutcome::Warning(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// EventPublisher
// ---------------------------------------------------------------------------

/// Publishes lifecycle envelopes to one configured topic.
///
/// Cheap to clone; clones share the broker handle.
#[derive(Clone)]
pub struct EventPublisher {
    producer: Arc<dyn BrokerProducer>,
    topic: String,
    send_timeout: Duration,
}

impl EventPublisher {
    pub fn new(producer: Arc<dyn BrokerProducer>, config: PublisherConfig) -> Self {
        Self {
            producer,
            topic: config.topic,
            send_timeout: config.send_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Build an envelope and send it keyed by `subject_key`.
    pub async fn publish(
        &self,
        event_type: EventType,
        subject_key: &str,
        payload: Payload,
    ) -> PublishOutcome {
        match Envelope::new(event_type, subject_key, payload) {
            Ok(envelope) => self.publish_envelope(&envelope).await,
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    %event_type,
                    subject_key,
                    error = %e,
                    "Event not published",
                );
                PublishOutcome::Warning(e.into())
            }
        }
    }

    /// Send an already-built envelope.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> PublishOutcome {
        match self.try_send(envelope).await {
            Ok(meta) => {
                tracing::info!(
                    topic = %meta.topic,
                    partition = meta.partition,
                    offset = meta.offset,
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    subject_key = %envelope.subject_key(),
                    "Event published",
                );
                PublishOutcome::Published(meta)
            }
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    subject_key = %envelope.subject_key(),
                    error = %e,
                    "Event not published",
                );
                PublishOutcome::Warning(e)
            }
        }
    }

    async fn try_send(&self, envelope: &Envelope) -> Result<RecordMetadata, PublishError> {
        let bytes = envelope.encode()?;
        let send = self
            .producer
            .send(&self.topic, envelope.subject_key(), bytes);
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PublishError::Timeout(self.send_timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::memory::InMemoryBroker;

    fn publisher(broker: &InMemoryBroker) -> EventPublisher {
        EventPublisher::new(Arc::new(broker.clone()), PublisherConfig::new("user-events"))
    }

    fn address(a: &str) -> Payload {
        Payload::from([("address".to_string(), a.to_string())])
    }

    /// Never answers.
    struct Stalled;

    #[async_trait]
    impl BrokerProducer for Stalled {
        async fn send(
            &self,
            _topic: &str,
            _key: &str,
            _payload: Vec<u8>,
        ) -> Result<RecordMetadata, BrokerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn publish_keys_record_by_subject() {
        let broker = InMemoryBroker::default();
        let outcome = publisher(&broker)
            .publish(EventType::Created, "42", address("a@x.com"))
            .await;

        let meta = outcome.metadata().cloned().unwrap();
        assert_eq!(meta.partition, broker.partition_for("42"));

        let records = broker.records("user-events");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("42"));

        let envelope = Envelope::decode(&records[0].payload).unwrap();
        assert_eq!(envelope.event_type(), EventType::Created);
        assert_eq!(envelope.field("address"), Some("a@x.com"));
    }

    #[tokio::test]
    async fn empty_subject_key_is_a_warning_not_a_send() {
        let broker = InMemoryBroker::default();
        let outcome = publisher(&broker)
            .publish(EventType::Created, "", address("a@x.com"))
            .await;

        assert_matches!(
            outcome,
            PublishOutcome::Warning(PublishError::Envelope(EnvelopeError::EmptySubjectKey))
        );
        assert!(broker.records("user-events").is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_warning() {
        let broker = InMemoryBroker::default();
        broker.set_available(false);

        let outcome = publisher(&broker)
            .publish(EventType::Deleted, "42", address("a@x.com"))
            .await;

        assert!(!outcome.is_published());
        assert_matches!(
            outcome.warning(),
            Some(PublishError::Broker(BrokerError::Unavailable(_)))
        );
    }

    #[tokio::test]
    async fn stalled_broker_times_out() {
        let mut config = PublisherConfig::new("user-events");
        config.send_timeout = Duration::from_millis(10);
        let publisher = EventPublisher::new(Arc::new(Stalled), config);

        let outcome = publisher
            .publish(EventType::Created, "42", address("a@x.com"))
            .await;

        assert_matches!(outcome, PublishOutcome::Warning(PublishError::Timeout(_)));
    }
}

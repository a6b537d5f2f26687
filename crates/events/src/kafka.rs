//! Kafka adapter for the broker traits.
//!
//! Producing goes through a shared `FutureProducer`. Consuming creates one
//! `StreamConsumer` per subscription with auto-commit disabled, so offsets
//! only move when a [`PartitionStream::commit`] is issued after a handler
//! succeeded. A demux task reads the consumer and fans records out to one
//! channel per assigned partition; each new partition is announced through
//! [`Subscription::next_partition`].
//!
//! Revocations are detected by comparing the consumer's assignment on a
//! fixed interval. A revoked partition's channel is closed, which the
//! partition worker observes as end-of-stream. When a worker goes away
//! with records still uncommitted, the next stream for that partition starts
//! from this member's last commit; if that position cannot be restored the
//! consumer rejoins the group and resumes from the group's committed offsets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use herald_core::config;
use herald_core::error::ConfigError;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    BrokerConsumer, BrokerError, BrokerProducer, GroupId, Offset, PartitionId, PartitionStream,
    Record, RecordMetadata, Subscription,
};

/// Records buffered per partition between the demux task and its worker.
const PARTITION_BUFFER: usize = 256;

/// How often the demux task compares its channels against the assignment.
const ASSIGNMENT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on a seek issued for redelivery.
const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for the Kafka cluster.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` bootstrap list.
    pub brokers: String,
}

impl KafkaConfig {
    /// | Variable        | Required | Default |
    /// |-----------------|----------|---------|
    /// | `KAFKA_BROKERS` | yes      | —       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            brokers: config::required("KAFKA_BROKERS")?,
        })
    }
}

fn kafka_error(e: KafkaError) -> BrokerError {
    BrokerError::Operation(e.to_string())
}

// ---------------------------------------------------------------------------
// KafkaBroker
// ---------------------------------------------------------------------------

/// Shared handle to a Kafka cluster.
#[derive(Clone)]
pub struct KafkaBroker {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaBroker {
    pub fn connect(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        tracing::info!(brokers = %config.brokers, "Kafka producer created");
        Ok(Self {
            brokers: config.brokers.clone(),
            producer,
        })
    }
}

#[async_trait]
impl BrokerProducer for KafkaBroker {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordMetadata, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        match self.producer.send(record, Duration::ZERO).await {
            Ok((partition, offset)) => Ok(RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(kafka_error(e)),
        }
    }
}

#[async_trait]
impl BrokerConsumer for KafkaBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &GroupId,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group.as_str())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        consumer.subscribe(&[topic]).map_err(kafka_error)?;

        let shared = Arc::new(SharedConsumer {
            consumer,
            topic: topic.to_string(),
            committed: Mutex::new(HashMap::new()),
        });
        let (assigned_tx, assigned_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(demux(Arc::clone(&shared), assigned_tx, shutdown.clone()));

        tracing::info!(%topic, %group, "Kafka consumer subscribed");
        Ok(Box::new(KafkaSubscription {
            assigned: assigned_rx,
            shutdown,
        }))
    }
}

// ---------------------------------------------------------------------------
// Shared consumer and demux
// ---------------------------------------------------------------------------

struct SharedConsumer {
    consumer: StreamConsumer,
    topic: String,
    /// Next offset to read per partition, as last committed by this member.
    committed: Mutex<HashMap<PartitionId, Offset>>,
}

impl SharedConsumer {
    fn committed(&self) -> MutexGuard<'_, HashMap<PartitionId, Offset>> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_assigned(&self, partition: PartitionId) -> bool {
        self.consumer
            .assignment()
            .map(|tpl| {
                tpl.elements_for_topic(&self.topic)
                    .iter()
                    .any(|elem| elem.partition() == partition)
            })
            .unwrap_or(false)
    }

    fn seek(&self, partition: PartitionId, offset: KafkaOffset) -> Result<(), BrokerError> {
        self.consumer
            .seek(&self.topic, partition, offset, SEEK_TIMEOUT)
            .map_err(kafka_error)
    }

    /// Position a partition back at this member's last commit.
    ///
    /// Fails when this member never committed on the partition, since the
    /// group's stored position is only restored by a rebalance.
    fn rewind(&self, partition: PartitionId) -> Result<(), BrokerError> {
        let target = self.committed().get(&partition).copied().ok_or_else(|| {
            BrokerError::Operation(format!("no local commit for partition {partition}"))
        })?;
        self.seek(partition, KafkaOffset::Offset(target))
    }

    /// Leave and rejoin the group so every partition restarts from the
    /// group's committed offsets.
    fn rejoin(&self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(kafka_error)
    }
}

/// How the demux continues after a record arrives for a partition.
#[derive(Debug, PartialEq, Eq)]
enum Takeover {
    /// Start a stream and hand it this record.
    Fresh,
    /// The partition was rewound; start a stream and let the seek replay
    /// this record.
    Rewound,
    /// The partition could not be rewound. Start nothing and rejoin the
    /// group; the record is fetched again from the committed offset.
    Rejoin,
}

/// Decide how to take over a partition whose previous worker is gone.
/// `rewind` only runs for a stale partition.
fn takeover(stale: bool, rewind: impl FnOnce() -> Result<(), BrokerError>) -> Takeover {
    if !stale {
        return Takeover::Fresh;
    }
    match rewind() {
        Ok(()) => Takeover::Rewound,
        Err(_) => Takeover::Rejoin,
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

type PartitionSender = mpsc::Sender<Record>;

/// Route consumed records to their partition workers until `shutdown`.
async fn demux(
    shared: Arc<SharedConsumer>,
    assigned: mpsc::UnboundedSender<Box<dyn PartitionStream>>,
    shutdown: CancellationToken,
) {
    let mut partitions: HashMap<PartitionId, PartitionSender> = HashMap::new();
    let mut assignment_check = tokio::time::interval(ASSIGNMENT_CHECK_INTERVAL);

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = assignment_check.tick() => {
                partitions.retain(|partition, sender| {
                    let keep = !sender.is_closed() && shared.is_assigned(*partition);
                    if !keep {
                        tracing::info!(topic = %shared.topic, partition, "Partition released");
                    }
                    keep
                });
                continue;
            }
            received = shared.consumer.recv() => received,
        };

        let record = match received {
            Ok(message) => to_record(&message),
            Err(e) => {
                tracing::warn!(topic = %shared.topic, error = %e, "Kafka receive failed");
                continue;
            }
        };
        let partition = record.partition;

        let live = partitions
            .get(&partition)
            .filter(|sender| !sender.is_closed())
            .cloned();
        let sender = match live {
            Some(sender) => sender,
            None => {
                // A stale entry means the previous worker went away without
                // committing everything it saw.
                let stale = partitions.remove(&partition).is_some();
                let action = takeover(stale, || {
                    shared.rewind(partition).inspect_err(|e| {
                        tracing::warn!(topic = %shared.topic, partition, error = %e, "Rewind failed");
                    })
                });
                if action == Takeover::Rejoin {
                    tracing::warn!(topic = %shared.topic, partition, "Rejoining group to restore committed offsets");
                    partitions.clear();
                    if let Err(e) = shared.rejoin() {
                        tracing::error!(topic = %shared.topic, error = %e, "Rejoin failed, stopping consumer");
                        break;
                    }
                    continue;
                }
                let (tx, rx) = mpsc::channel(PARTITION_BUFFER);
                let stream = KafkaPartition {
                    shared: Arc::clone(&shared),
                    partition,
                    records: rx,
                    rewind_to: None,
                };
                if assigned.send(Box::new(stream)).is_err() {
                    break;
                }
                tracing::info!(topic = %shared.topic, partition, "Partition assigned");
                partitions.insert(partition, tx.clone());
                if action == Takeover::Rewound {
                    continue;
                }
                tx
            }
        };

        if sender.send(record).await.is_err() {
            tracing::debug!(topic = %shared.topic, partition, "Partition worker gone");
        }
    }

    shared.consumer.unsubscribe();
    tracing::info!(topic = %shared.topic, "Kafka consumer stopped");
}

// ---------------------------------------------------------------------------
// Subscription and partition stream
// ---------------------------------------------------------------------------

struct KafkaSubscription {
    assigned: mpsc::UnboundedReceiver<Box<dyn PartitionStream>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_partition(&mut self) -> Option<Box<dyn PartitionStream>> {
        self.assigned.recv().await
    }
}

impl Drop for KafkaSubscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct KafkaPartition {
    shared: Arc<SharedConsumer>,
    partition: PartitionId,
    records: mpsc::Receiver<Record>,
    /// After a redelivery seek, records already buffered past this offset
    /// are stale and skipped until the seek target shows up again.
    rewind_to: Option<Offset>,
}

#[async_trait]
impl PartitionStream for KafkaPartition {
    fn topic(&self) -> &str {
        &self.shared.topic
    }

    fn partition(&self) -> PartitionId {
        self.partition
    }

    async fn recv(&mut self) -> Result<Option<Record>, BrokerError> {
        while let Some(record) = self.records.recv().await {
            match self.rewind_to {
                Some(target) if record.offset != target => continue,
                Some(_) => self.rewind_to = None,
                None => {}
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    async fn commit(&mut self, record: &Record) -> Result<(), BrokerError> {
        if !self.shared.is_assigned(self.partition) {
            return Err(BrokerError::NotOwner {
                topic: self.shared.topic.clone(),
                partition: self.partition,
            });
        }
        let next = record.offset + 1;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.shared.topic, self.partition, KafkaOffset::Offset(next))
            .map_err(kafka_error)?;
        self.shared
            .consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(kafka_error)?;

        let mut committed = self.shared.committed();
        let entry = committed.entry(self.partition).or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn redeliver(&mut self, record: &Record) -> Result<(), BrokerError> {
        self.shared
            .seek(self.partition, KafkaOffset::Offset(record.offset))?;
        self.rewind_to = Some(record.offset);
        tracing::debug!(
            topic = %self.shared.topic,
            partition = self.partition,
            offset = record.offset,
            "Seeked back for redelivery",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn from_env_requires_brokers() {
        std::env::remove_var("KAFKA_BROKERS");
        assert_matches!(
            KafkaConfig::from_env(),
            Err(ConfigError::Missing("KAFKA_BROKERS"))
        );
    }

    #[test]
    fn live_partition_takes_record_without_rewinding() {
        let action = takeover(false, || panic!("rewind must not run"));
        assert_eq!(action, Takeover::Fresh);
    }

    #[test]
    fn stale_partition_replays_after_rewind() {
        assert_eq!(takeover(true, || Ok(())), Takeover::Rewound);
    }

    #[test]
    fn failed_rewind_rejoins_instead_of_dropping_record() {
        let action = takeover(true, || Err(BrokerError::Operation("seek timed out".into())));
        assert_eq!(action, Takeover::Rejoin);
    }

    #[tokio::test]
    async fn producer_is_created_without_contacting_cluster() {
        let config = KafkaConfig {
            brokers: "localhost:9092".into(),
        };
        assert!(KafkaBroker::connect(&config).is_ok());
    }
}

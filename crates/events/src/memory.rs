//! In-process broker.
//!
//! [`InMemoryBroker`] implements the full broker contract inside one
//! process: keyed partitioning, per-group committed offsets, exclusive
//! partition ownership, and replay of uncommitted records. It backs the
//! test suites and single-process deployments; it is cheap to clone and
//! every clone shares the same log.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{
    BrokerConsumer, BrokerError, BrokerProducer, GroupId, Offset, PartitionId, PartitionStream,
    Record, RecordMetadata, Subscription,
};

/// Partitions created per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: usize = 4;

/// Most recent commits kept for [`InMemoryBroker::commits`].
const COMMIT_HISTORY: usize = 1024;

/// Pause before a handed-back record becomes visible again.
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

type OwnerKey = (String, GroupId, PartitionId);

/// One successful commit, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub topic: String,
    pub group: GroupId,
    pub partition: PartitionId,
    pub offset: Offset,
}

struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// Next offset to deliver per (topic, group, partition).
    committed: HashMap<OwnerKey, Offset>,
    owners: HashSet<OwnerKey>,
    commits: VecDeque<CommitEntry>,
    available: bool,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    changed: Notify,
    partitions: usize,
    redelivery_delay: Duration,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker whose topics have `partitions` partitions each.
    pub fn new(partitions: usize) -> Self {
        Self::with_redelivery_delay(partitions, DEFAULT_REDELIVERY_DELAY)
    }

    /// Create a broker with an explicit redelivery backoff.
    pub fn with_redelivery_delay(partitions: usize, redelivery_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    owners: HashSet::new(),
                    commits: VecDeque::new(),
                    available: true,
                    closed: false,
                }),
                changed: Notify::new(),
                partitions: partitions.max(1),
                redelivery_delay,
            }),
        }
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as PartitionId
    }

    /// Simulate losing (or regaining) the connection to the broker.
    ///
    /// While unavailable, sends and new subscriptions fail with
    /// [`BrokerError::Unavailable`]. Existing partition streams keep working.
    pub fn set_available(&self, available: bool) {
        self.inner.state().available = available;
    }

    /// Shut the broker down. Every waiting consumer observes end-of-stream.
    pub fn close(&self) {
        self.inner.state().closed = true;
        self.inner.changed.notify_waiters();
    }

    /// Next offset `group` will be handed on a partition, if it ever committed.
    pub fn committed_offset(
        &self,
        topic: &str,
        group: &GroupId,
        partition: PartitionId,
    ) -> Option<Offset> {
        self.inner
            .state()
            .committed
            .get(&(topic.to_string(), group.clone(), partition))
            .copied()
    }

    /// The most recent commits, oldest first.
    pub fn commits(&self) -> Vec<CommitEntry> {
        self.inner.state().commits.iter().cloned().collect()
    }

    /// All records of a topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether some member of `group` currently owns the partition.
    pub fn is_owned(&self, topic: &str, group: &GroupId, partition: PartitionId) -> bool {
        self.inner
            .state()
            .owners
            .contains(&(topic.to_string(), group.clone(), partition))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

fn ensure_topic<'a>(state: &'a mut State, topic: &str, partitions: usize) -> &'a mut Vec<Vec<Record>> {
    state
        .topics
        .entry(topic.to_string())
        .or_insert_with(|| vec![Vec::new(); partitions])
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordMetadata, BrokerError> {
        let partition = self.partition_for(key);
        let metadata = {
            let mut state = self.inner.state();
            if !state.available || state.closed {
                return Err(BrokerError::Unavailable("in-memory broker is offline".into()));
            }
            let log = &mut ensure_topic(&mut state, topic, self.inner.partitions)[partition as usize];
            let offset = log.len() as Offset;
            log.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(key.to_string()),
                payload,
            });
            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }
        };
        self.inner.changed.notify_waiters();
        Ok(metadata)
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &GroupId,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        {
            let mut state = self.inner.state();
            if !state.available || state.closed {
                return Err(BrokerError::Unavailable("in-memory broker is offline".into()));
            }
            ensure_topic(&mut state, topic, self.inner.partitions);
        }
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct MemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    group: GroupId,
}

impl MemorySubscription {
    /// Claim the first partition nobody in the group owns.
    fn claim(&self) -> Option<MemoryPartition> {
        let mut state = self.inner.state();
        for partition in 0..self.inner.partitions as PartitionId {
            let key = (self.topic.clone(), self.group.clone(), partition);
            if state.owners.contains(&key) {
                continue;
            }
            let position = state.committed.get(&key).copied().unwrap_or(0);
            state.owners.insert(key);
            return Some(MemoryPartition {
                inner: Arc::clone(&self.inner),
                topic: self.topic.clone(),
                group: self.group.clone(),
                partition,
                position,
            });
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_partition(&mut self) -> Option<Box<dyn PartitionStream>> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state().closed {
                return None;
            }
            if let Some(stream) = self.claim() {
                tracing::debug!(
                    topic = %self.topic,
                    group = %self.group,
                    partition = stream.partition,
                    position = stream.position,
                    "Partition assigned",
                );
                return Some(Box::new(stream));
            }

            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Partition stream
// ---------------------------------------------------------------------------

struct MemoryPartition {
    inner: Arc<Inner>,
    topic: String,
    group: GroupId,
    partition: PartitionId,
    /// Next offset to hand out.
    position: Offset,
}

impl MemoryPartition {
    fn key(&self) -> OwnerKey {
        (self.topic.clone(), self.group.clone(), self.partition)
    }

    fn not_owner(&self) -> BrokerError {
        BrokerError::NotOwner {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }
}

#[async_trait]
impl PartitionStream for MemoryPartition {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> PartitionId {
        self.partition
    }

    async fn recv(&mut self) -> Result<Option<Record>, BrokerError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state();
                if state.closed {
                    return Ok(None);
                }
                let next = state
                    .topics
                    .get(&self.topic)
                    .and_then(|partitions| partitions.get(self.partition as usize))
                    .and_then(|log| log.get(self.position as usize))
                    .cloned();
                if let Some(record) = next {
                    self.position += 1;
                    return Ok(Some(record));
                }
            }

            notified.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<(), BrokerError> {
        let key = self.key();
        let mut state = self.inner.state();
        if !state.owners.contains(&key) {
            return Err(self.not_owner());
        }
        let next = record.offset + 1;
        let committed = state.committed.entry(key).or_insert(0);
        *committed = (*committed).max(next);
        if state.commits.len() == COMMIT_HISTORY {
            state.commits.pop_front();
        }
        state.commits.push_back(CommitEntry {
            topic: self.topic.clone(),
            group: self.group.clone(),
            partition: self.partition,
            offset: record.offset,
        });
        Ok(())
    }

    async fn redeliver(&mut self, record: &Record) -> Result<(), BrokerError> {
        tokio::time::sleep(self.inner.redelivery_delay).await;

        let key = self.key();
        let state = self.inner.state();
        if !state.owners.contains(&key) {
            return Err(self.not_owner());
        }
        self.position = state.committed.get(&key).copied().unwrap_or(0);
        tracing::debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = record.offset,
            rewind_to = self.position,
            "Record handed back for redelivery",
        );
        Ok(())
    }
}

impl Drop for MemoryPartition {
    fn drop(&mut self) {
        let key = self.key();
        self.inner.state().owners.remove(&key);
        self.inner.changed.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupId {
        GroupId::new("test-group").unwrap()
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition_in_order() {
        let broker = InMemoryBroker::default();
        let first = broker.send("t", "42", b"1".to_vec()).await.unwrap();
        let second = broker.send("t", "42", b"2".to_vec()).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn send_routes_by_partition_for() {
        let broker = InMemoryBroker::default();
        let meta = broker.send("user-events", "42", b"{}".to_vec()).await.unwrap();
        assert_eq!(meta.partition, broker.partition_for("42"));
        assert_eq!(broker.records("user-events").len(), 1);
    }

    #[tokio::test]
    async fn commit_history_is_bounded() {
        let broker = InMemoryBroker::new(1);
        for i in 0..COMMIT_HISTORY + 10 {
            broker.send("t", "k", vec![i as u8]).await.unwrap();
        }
        let mut sub = broker.subscribe("t", &group()).await.unwrap();
        let mut stream = sub.next_partition().await.unwrap();
        for _ in 0..COMMIT_HISTORY + 10 {
            let record = stream.recv().await.unwrap().unwrap();
            stream.commit(&record).await.unwrap();
        }

        let commits = broker.commits();
        assert_eq!(commits.len(), COMMIT_HISTORY);
        assert_eq!(commits[0].offset, 10);
        assert_eq!(
            broker.committed_offset("t", &group(), 0),
            Some((COMMIT_HISTORY + 10) as Offset)
        );
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_sends() {
        let broker = InMemoryBroker::default();
        broker.set_available(false);

        let err = broker.send("t", "42", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(broker.records("t").is_empty());
    }

    #[tokio::test]
    async fn partitions_have_a_single_owner_per_group() {
        let broker = InMemoryBroker::new(1);
        let mut first = broker.subscribe("t", &group()).await.unwrap();
        let mut second = broker.subscribe("t", &group()).await.unwrap();

        let owned = first.next_partition().await.unwrap();
        assert!(broker.is_owned("t", &group(), owned.partition()));

        // The second member only gets the partition once the first lets go.
        let waiting = tokio::time::timeout(Duration::from_millis(50), second.next_partition()).await;
        assert!(waiting.is_err());

        drop(owned);
        let handed_over = second.next_partition().await.unwrap();
        assert_eq!(handed_over.partition(), 0);
    }

    #[tokio::test]
    async fn uncommitted_records_replay_to_next_owner() {
        let broker = InMemoryBroker::new(1);
        broker.send("t", "k", b"a".to_vec()).await.unwrap();
        broker.send("t", "k", b"b".to_vec()).await.unwrap();

        let mut sub = broker.subscribe("t", &group()).await.unwrap();
        let mut stream = sub.next_partition().await.unwrap();
        let a = stream.recv().await.unwrap().unwrap();
        stream.commit(&a).await.unwrap();
        let b = stream.recv().await.unwrap().unwrap();
        assert_eq!(b.payload, b"b");
        drop(stream); // crash before committing `b`

        let mut stream = sub.next_partition().await.unwrap();
        let replayed = stream.recv().await.unwrap().unwrap();
        assert_eq!(replayed.offset, b.offset);
        assert_eq!(broker.committed_offset("t", &group(), 0), Some(1));
    }

    #[tokio::test]
    async fn redeliver_rewinds_to_committed_offset() {
        let broker = InMemoryBroker::with_redelivery_delay(1, Duration::ZERO);
        broker.send("t", "k", b"a".to_vec()).await.unwrap();

        let mut sub = broker.subscribe("t", &group()).await.unwrap();
        let mut stream = sub.next_partition().await.unwrap();
        let first = stream.recv().await.unwrap().unwrap();
        stream.redeliver(&first).await.unwrap();

        let again = stream.recv().await.unwrap().unwrap();
        assert_eq!(again, first);
        assert!(broker.commits().is_empty());
    }

    #[tokio::test]
    async fn close_ends_waiting_streams() {
        let broker = InMemoryBroker::new(1);
        let mut sub = broker.subscribe("t", &group()).await.unwrap();
        let mut stream = sub.next_partition().await.unwrap();

        let waiter = tokio::spawn(async move { stream.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close();

        assert!(waiter.await.unwrap().unwrap().is_none());
        assert!(sub.next_partition().await.is_none());
    }
}

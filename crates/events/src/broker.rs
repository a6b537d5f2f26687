//! Broker abstraction.
//!
//! The broker is external infrastructure. The core only relies on this
//! contract:
//!
//! - records sent with the same key land on the same partition and are
//!   delivered in send order;
//! - within a consumer group each partition has at most one live owner;
//! - a record whose offset was not committed is delivered again, either to
//!   the same owner after [`PartitionStream::redeliver`] or to the next owner
//!   after the current one goes away.
//!
//! Handles are shared process-wide behind `Arc<dyn ...>` and passed into
//! constructors explicitly so tests can swap in
//! [`InMemoryBroker`](crate::memory::InMemoryBroker).

use std::fmt;

use async_trait::async_trait;

/// Partition index within a topic.
pub type PartitionId = i32;

/// Position of a record within its partition.
pub type Offset = i64;

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Durable identity shared by all instances of one consumer service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(String);

impl GroupId {
    /// Returns `None` for a blank identifier.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        (!id.trim().is_empty()).then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A raw record as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Where a successfully sent record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Broker-side failure.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No route or connection to the broker.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected or failed the operation.
    #[error("broker operation failed: {0}")]
    Operation(String),

    /// This member no longer owns the partition it tried to use.
    #[error("partition {partition} of {topic} is not owned by this member")]
    NotOwner {
        topic: String,
        partition: PartitionId,
    },
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Sending side of the broker.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Send one record, partitioned by `key`.
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<RecordMetadata, BrokerError>;
}

/// Receiving side of the broker.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Join `group` on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        group: &GroupId,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A group membership on one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next partition assigned to this member.
    ///
    /// Returns `None` once the membership has ended and no further
    /// partitions will be handed out.
    async fn next_partition(&mut self) -> Option<Box<dyn PartitionStream>>;
}

/// Exclusive, ordered access to one partition.
///
/// Dropping the stream releases ownership; uncommitted records are then
/// replayed to the next owner.
#[async_trait]
pub trait PartitionStream: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> PartitionId;

    /// Wait for the next record. `Ok(None)` means the partition was revoked
    /// or the broker shut down.
    async fn recv(&mut self) -> Result<Option<Record>, BrokerError>;

    /// Durably mark `record` and everything before it as processed.
    async fn commit(&mut self, record: &Record) -> Result<(), BrokerError>;

    /// Give `record` back to the broker for a later redelivery.
    ///
    /// The committed offset stays where it is, so the record and everything
    /// after it is delivered again.
    async fn redeliver(&mut self, record: &Record) -> Result<(), BrokerError>;
}

//! Event publishing and delivery for herald.
//!
//! The producing service publishes lifecycle [`Envelope`]s through an
//! [`EventPublisher`]; the notification service consumes them with a
//! [`ConsumerWorker`] that routes each record to an [`EventHandler`] via the
//! [`Dispatcher`], committing only once the side effect has completed.
//!
//! - [`broker`] — broker contract: keyed partitions, groups, commits.
//! - [`memory`] — in-process broker implementing that contract.
//! - [`kafka`] — Kafka adapter (feature `kafka`).
//! - [`envelope`] — wire envelope and event types.
//! - [`publisher`] — best-effort publishing after a primary commit.
//! - [`dispatcher`] / [`consumer`] — at-least-once delivery to handlers.
//! - [`notification`] / [`delivery`] — templated email side effects.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod delivery;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod notification;
pub mod publisher;
pub mod retry;

pub use broker::{BrokerConsumer, BrokerError, BrokerProducer, GroupId, Record, RecordMetadata};
pub use config::{ConsumerConfig, PublisherConfig};
pub use consumer::ConsumerWorker;
pub use dead_letter::{BrokerDeadLetterSink, DeadLetter, DeadLetterSink};
pub use delivery::email::{EmailConfig, MailError, MailTransport, SmtpMailer};
pub use dispatcher::{DeliveryState, Dispatcher, Disposition};
pub use envelope::{DecodeError, Envelope, EnvelopeError, EventType, Payload};
pub use handler::{EventHandler, HandlerError, HandlerRegistry};
pub use memory::InMemoryBroker;
pub use notification::NotificationHandler;
pub use publisher::{EventPublisher, PublishError, PublishOutcome};
pub use retry::RetryPolicy;

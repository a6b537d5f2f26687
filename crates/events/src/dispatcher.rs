//! Decode, route, and acknowledge one record at a time.
//!
//! [`Dispatcher::process`] takes a record fresh from a partition stream and
//! drives it through
//! `RECEIVED → DISPATCHED → {ACKNOWLEDGED | REDELIVER_PENDING}`.
//! The offset is committed only after the handler reports success, or when
//! the record is poison (it would never succeed, so holding it back would
//! only block the partition).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, PartitionStream, Record};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::envelope::Envelope;
use crate::handler::{EventHandler, HandlerError, HandlerRegistry};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Delivery state
// ---------------------------------------------------------------------------

/// Lifecycle of a single delivered record inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Dispatched,
    Acknowledged,
    /// Ownership went back to the broker; terminal for the dispatcher.
    RedeliverPending,
}

/// A received record and where it is in its lifecycle.
struct Delivery {
    record: Record,
    state: DeliveryState,
}

impl Delivery {
    fn received(record: Record) -> Self {
        Self {
            record,
            state: DeliveryState::Received,
        }
    }

    fn dispatch(&mut self) {
        debug_assert_eq!(self.state, DeliveryState::Received);
        self.state = DeliveryState::Dispatched;
    }

    fn acknowledge(&mut self) {
        debug_assert!(matches!(
            self.state,
            DeliveryState::Received | DeliveryState::Dispatched
        ));
        self.state = DeliveryState::Acknowledged;
    }

    fn hand_back(&mut self) {
        debug_assert_eq!(self.state, DeliveryState::Dispatched);
        self.state = DeliveryState::RedeliverPending;
    }
}

/// How the dispatcher disposed of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The handler succeeded and the offset was committed.
    Acknowledged,
    /// The record could never be handled; it was dead-lettered or dropped,
    /// then committed.
    Poisoned { reason: String },
    /// Every local attempt failed; the record was handed back to the broker
    /// uncommitted.
    RedeliverPending {
        attempts: u32,
        last_error: HandlerError,
    },
    /// Shutdown arrived between attempts; the record was left uncommitted.
    Abandoned,
}

impl Disposition {
    /// Final delivery state, or `None` for an abandoned record.
    pub fn state(&self) -> Option<DeliveryState> {
        match self {
            Disposition::Acknowledged | Disposition::Poisoned { .. } => {
                Some(DeliveryState::Acknowledged)
            }
            Disposition::RedeliverPending { .. } => Some(DeliveryState::RedeliverPending),
            Disposition::Abandoned => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes records to their handlers and controls acknowledgement.
///
/// Shared by every partition worker of a process via `Arc<Dispatcher>`.
pub struct Dispatcher {
    registry: HandlerRegistry,
    retry: RetryPolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl Dispatcher {
    /// Create a dispatcher with the default retry policy and no dead-letter
    /// sink.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            dead_letters: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Process one record received from `stream`.
    ///
    /// Errors are only returned when the broker itself fails to commit or
    /// take the record back; handler failures are always absorbed into the
    /// returned [`Disposition`].
    pub async fn process(
        &self,
        stream: &mut dyn PartitionStream,
        record: Record,
        cancel: &CancellationToken,
    ) -> Result<Disposition, BrokerError> {
        let mut delivery = Delivery::received(record);

        let envelope = match Envelope::decode(&delivery.record.payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.poison(stream, delivery, None, e.to_string()).await,
        };

        let Some(handler) = self.registry.get(envelope.event_type()) else {
            let reason = format!("no handler registered for {}", envelope.event_type());
            return self.poison(stream, delivery, Some(envelope), reason).await;
        };

        delivery.dispatch();
        tracing::debug!(
            topic = %delivery.record.topic,
            partition = delivery.record.partition,
            offset = delivery.record.offset,
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            subject_key = %envelope.subject_key(),
            "Dispatching event",
        );

        let mut delays = self.retry.delays();
        let mut attempts = 0u32;
        let last_error = loop {
            attempts += 1;
            match invoke(handler, &envelope).await {
                Ok(()) => {
                    stream.commit(&delivery.record).await?;
                    delivery.acknowledge();
                    tracing::info!(
                        partition = delivery.record.partition,
                        offset = delivery.record.offset,
                        event_id = %envelope.id(),
                        event_type = %envelope.event_type(),
                        subject_key = %envelope.subject_key(),
                        attempts,
                        "Event handled and acknowledged",
                    );
                    return Ok(Disposition::Acknowledged);
                }
                Err(e @ HandlerError::Rejected { .. }) => {
                    return self
                        .poison(stream, delivery, Some(envelope), e.to_string())
                        .await;
                }
                Err(e) => {
                    let Some(delay) = delays.next() else {
                        break e;
                    };
                    tracing::warn!(
                        partition = delivery.record.partition,
                        offset = delivery.record.offset,
                        event_id = %envelope.id(),
                        subject_key = %envelope.subject_key(),
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Handler failed, retrying",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!(
                                partition = delivery.record.partition,
                                offset = delivery.record.offset,
                                event_id = %envelope.id(),
                                "Shutdown during retry backoff, leaving record uncommitted",
                            );
                            return Ok(Disposition::Abandoned);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        tracing::error!(
            partition = delivery.record.partition,
            offset = delivery.record.offset,
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            subject_key = %envelope.subject_key(),
            attempts,
            error = %last_error,
            "Handler retries exhausted, handing record back to the broker",
        );
        stream.redeliver(&delivery.record).await?;
        delivery.hand_back();

        Ok(Disposition::RedeliverPending {
            attempts,
            last_error,
        })
    }

    /// Log, optionally dead-letter, then commit a record that can never be
    /// handled.
    async fn poison(
        &self,
        stream: &mut dyn PartitionStream,
        mut delivery: Delivery,
        envelope: Option<Envelope>,
        reason: String,
    ) -> Result<Disposition, BrokerError> {
        let record = &delivery.record;
        match &self.dead_letters {
            Some(sink) => {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    key = ?record.key,
                    payload = %String::from_utf8_lossy(&record.payload),
                    reason = %reason,
                    "Poison record, dead-lettering",
                );
                sink.record(DeadLetter::new(record, envelope, reason.clone()))
                    .await;
            }
            None => {
                tracing::error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    key = ?record.key,
                    payload = %String::from_utf8_lossy(&record.payload),
                    reason = %reason,
                    "Poison record dropped",
                );
            }
        }

        stream.commit(record).await?;
        delivery.acknowledge();
        Ok(Disposition::Poisoned { reason })
    }
}

/// Run a handler, turning a panic into a transient failure.
async fn invoke(handler: &Arc<dyn EventHandler>, envelope: &Envelope) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.handle(envelope))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::transient(
            envelope,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::broker::{BrokerConsumer, BrokerProducer, GroupId};
    use crate::envelope::{EventType, Payload};
    use crate::memory::InMemoryBroker;

    const TOPIC: &str = "user-events";

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(HandlerError::transient(envelope, "smtp down"))
            } else {
                Ok(())
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl EventHandler for Panics {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            panic!("template missing");
        }
    }

    struct Rejects;

    #[async_trait]
    impl EventHandler for Rejects {
        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            Err(HandlerError::rejected(envelope, "no address"))
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    async fn next_record(
        broker: &InMemoryBroker,
        payload: Vec<u8>,
    ) -> (Box<dyn PartitionStream>, Record) {
        broker.send(TOPIC, "42", payload).await.unwrap();
        let group = GroupId::new("g").unwrap();
        let mut sub = broker.subscribe(TOPIC, &group).await.unwrap();
        let mut stream = sub.next_partition().await.unwrap();
        let record = stream.recv().await.unwrap().unwrap();
        (stream, record)
    }

    fn created() -> Vec<u8> {
        let payload = Payload::from([("address".into(), "a@x.com".into())]);
        Envelope::new(EventType::Created, "42", payload)
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn success_commits_once() {
        let broker = InMemoryBroker::new(1);
        let handler = Flaky::new(0);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, handler.clone()),
        );
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Acknowledged);
        assert_eq!(disposition.state(), Some(DeliveryState::Acknowledged));
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.commits().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_local_retries() {
        let broker = InMemoryBroker::new(1);
        let handler = Flaky::new(2);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, handler.clone()),
        )
        .with_retry(fast_retry(3));
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Acknowledged);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_record_uncommitted() {
        let broker = InMemoryBroker::with_redelivery_delay(1, Duration::ZERO);
        let handler = Flaky::new(u32::MAX);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, handler.clone()),
        )
        .with_retry(fast_retry(2));
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(
            disposition,
            Disposition::RedeliverPending { attempts: 2, ref last_error } if last_error.is_transient()
        );
        assert_eq!(disposition.state(), Some(DeliveryState::RedeliverPending));
        assert!(broker.commits().is_empty());

        // The broker hands the same record out again.
        let again = stream.recv().await.unwrap().unwrap();
        assert_eq!(again.offset, record.offset);
    }

    #[tokio::test]
    async fn malformed_record_is_poison() {
        let broker = InMemoryBroker::new(1);
        let dispatcher = Dispatcher::new(HandlerRegistry::new());
        let (mut stream, record) = next_record(&broker, b"not json".to_vec()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(disposition, Disposition::Poisoned { .. });
        assert_eq!(broker.commits().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_type_is_poison() {
        let broker = InMemoryBroker::new(1);
        let handler = Flaky::new(0);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Deleted, handler.clone()),
        );
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(disposition, Disposition::Poisoned { reason } if reason.contains("CREATED"));
        assert_eq!(handler.calls(), 0);
        assert_eq!(broker.commits().len(), 1);
    }

    #[tokio::test]
    async fn rejected_envelope_is_poison_without_retries() {
        let broker = InMemoryBroker::new(1);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, Arc::new(Rejects)),
        )
        .with_retry(fast_retry(5));
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(disposition, Disposition::Poisoned { reason } if reason.contains("no address"));
        assert_eq!(broker.commits().len(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_transient_failure() {
        let broker = InMemoryBroker::with_redelivery_delay(1, Duration::ZERO);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, Arc::new(Panics)),
        )
        .with_retry(RetryPolicy::no_retry());
        let (mut stream, record) = next_record(&broker, created()).await;

        let disposition = dispatcher
            .process(stream.as_mut(), record, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(
            disposition,
            Disposition::RedeliverPending { ref last_error, .. }
                if last_error.to_string().contains("template missing")
        );
        assert!(broker.commits().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_backoff_abandons_record() {
        let broker = InMemoryBroker::new(1);
        let handler = Flaky::new(u32::MAX);
        let dispatcher = Dispatcher::new(
            HandlerRegistry::new().register(EventType::Created, handler.clone()),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            multiplier: 1.0,
        });
        let (mut stream, record) = next_record(&broker, created()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let disposition = dispatcher
            .process(stream.as_mut(), record, &cancel)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Abandoned);
        assert_eq!(handler.calls(), 1);
        assert!(broker.commits().is_empty());
    }
}

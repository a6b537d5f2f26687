#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_events::broker::{BrokerError, GroupId};
use herald_events::delivery::email::{MailError, MailTransport};
use herald_events::{
    ConsumerWorker, Dispatcher, EventType, HandlerRegistry, InMemoryBroker, NotificationHandler,
    RetryPolicy,
};

pub const TOPIC: &str = "user-events";
pub const GROUP: &str = "notification-group";

pub fn group() -> GroupId {
    GroupId::new(GROUP).unwrap()
}

/// One mail as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records every mail; fails every send while an outage is simulated.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    attempts: AtomicU32,
    outage: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let mailer = Self::default();
        mailer.outage.store(true, Ordering::SeqCst);
        Arc::new(mailer)
    }

    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(MailError::Timeout(Duration::from_secs(10)));
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        });
        Ok(())
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

/// Dispatcher that emails on both lifecycle events.
pub fn notification_dispatcher(mailer: Arc<RecordingMailer>, retry: RetryPolicy) -> Arc<Dispatcher> {
    let handler = Arc::new(NotificationHandler::new(mailer, Duration::from_secs(1)));
    let registry = HandlerRegistry::new()
        .register(EventType::Created, handler.clone())
        .register(EventType::Deleted, handler);
    Arc::new(Dispatcher::new(registry).with_retry(retry))
}

/// A running group member and the handle to stop it.
pub struct RunningWorker {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), BrokerError>>,
}

impl RunningWorker {
    pub async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub fn start_worker(broker: &InMemoryBroker, dispatcher: Arc<Dispatcher>) -> RunningWorker {
    let worker = ConsumerWorker::new(Arc::new(broker.clone()), dispatcher, TOPIC, group());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(cancel.clone()));
    RunningWorker { cancel, handle }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

//! Wiring for the notification service.
//!
//! The binary loads a [`NotifierConfig`], installs tracing, and runs a
//! [`ConsumerWorker`](herald_events::ConsumerWorker) over the dispatcher
//! built by [`build_dispatcher`]. Everything here is broker-agnostic so the
//! same wiring runs against the in-memory broker in tests.

use std::sync::Arc;

use herald_core::config;
use herald_core::error::ConfigError;
use herald_events::broker::BrokerProducer;
use herald_events::{
    BrokerDeadLetterSink, ConsumerConfig, Dispatcher, EmailConfig, EventType, HandlerRegistry,
    MailTransport, NotificationHandler,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "herald_notifier=info,herald_events=info";

/// Everything the notification service needs at startup.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub consumer: ConsumerConfig,
    pub email: EmailConfig,
}

impl NotifierConfig {
    /// Load the consumer and SMTP settings. See
    /// [`ConsumerConfig::from_env`] and [`EmailConfig::from_env`] for the
    /// variables read.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            consumer: ConsumerConfig::from_env()?,
            email: EmailConfig::from_env()?,
        })
    }
}

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// `LOG_FORMAT=json` selects JSON output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = config::optional("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Route CREATED and DELETED to the email handler and attach the
/// dead-letter topic, if one is configured.
pub fn build_dispatcher(
    config: &NotifierConfig,
    mailer: Arc<dyn MailTransport>,
    dead_letter_producer: Arc<dyn BrokerProducer>,
) -> Arc<Dispatcher> {
    let handler = Arc::new(NotificationHandler::new(mailer, config.email.timeout));
    let registry = HandlerRegistry::new()
        .register(EventType::Created, handler.clone())
        .register(EventType::Deleted, handler);

    let mut dispatcher = Dispatcher::new(registry).with_retry(config.consumer.retry.clone());
    match &config.consumer.dead_letter_topic {
        Some(topic) => {
            tracing::info!(dead_letter_topic = %topic, "Dead-lettering poison records");
            dispatcher = dispatcher.with_dead_letters(Arc::new(BrokerDeadLetterSink::new(
                dead_letter_producer,
                topic.clone(),
            )));
        }
        None => tracing::info!("No dead-letter topic configured; poison records are dropped"),
    }
    Arc::new(dispatcher)
}

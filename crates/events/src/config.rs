//! Broker-side configuration for publishers and consumers.
//!
//! Loaded once at startup. A missing topic or group id is a
//! [`ConfigError`] and the process must not start serving.

use std::time::Duration;

use herald_core::config;
use herald_core::error::ConfigError;

use crate::broker::GroupId;
use crate::retry::RetryPolicy;

/// Default bound on a single publish attempt.
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;

/// Configuration for [`EventPublisher`](crate::publisher::EventPublisher).
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Destination topic for every envelope.
    pub topic: String,
    /// Bound on one send attempt.
    pub send_timeout: Duration,
}

impl PublisherConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            send_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable             | Required | Default |
    /// |----------------------|----------|---------|
    /// | `EVENTS_TOPIC`       | yes      | —       |
    /// | `PUBLISH_TIMEOUT_MS` | no       | `5000`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            topic: config::required("EVENTS_TOPIC")?,
            send_timeout: Duration::from_millis(config::parse_or(
                "PUBLISH_TIMEOUT_MS",
                DEFAULT_PUBLISH_TIMEOUT_MS,
            )?),
        })
    }
}

/// Configuration for [`ConsumerWorker`](crate::consumer::ConsumerWorker).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Durable group identity shared by all instances of the service.
    pub group: GroupId,
    /// Where poison records go; `None` drops them with a logged error.
    pub dead_letter_topic: Option<String>,
    /// Local retries before a record goes back to the broker.
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group: GroupId) -> Self {
        Self {
            topic: topic.into(),
            group,
            dead_letter_topic: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable                     | Required | Default |
    /// |------------------------------|----------|---------|
    /// | `EVENTS_TOPIC`               | yes      | —       |
    /// | `CONSUMER_GROUP_ID`          | yes      | —       |
    /// | `DEAD_LETTER_TOPIC`          | no       | —       |
    /// | `HANDLER_MAX_ATTEMPTS`       | no       | `3`     |
    /// | `HANDLER_INITIAL_BACKOFF_MS` | no       | `200`   |
    /// | `HANDLER_MAX_BACKOFF_MS`     | no       | `5000`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        let topic = config::required("EVENTS_TOPIC")?;
        let group = GroupId::new(config::required("CONSUMER_GROUP_ID")?)
            .ok_or(ConfigError::Missing("CONSUMER_GROUP_ID"))?;

        let defaults = RetryPolicy::default();
        let max_attempts: u32 = config::parse_or("HANDLER_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "HANDLER_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }
        let retry = RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(config::parse_or(
                "HANDLER_INITIAL_BACKOFF_MS",
                defaults.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(config::parse_or(
                "HANDLER_MAX_BACKOFF_MS",
                defaults.max_backoff.as_millis() as u64,
            )?),
            multiplier: defaults.multiplier,
        };

        Ok(Self {
            topic,
            group,
            dead_letter_topic: config::optional("DEAD_LETTER_TOPIC"),
            retry,
        })
    }
}

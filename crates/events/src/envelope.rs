//! Wire-level event envelope.
//!
//! An [`Envelope`] is the immutable unit carried from the publisher to every
//! consumer group: an [`EventType`] tag, the subject key the broker
//! partitions on, and a flat string payload. It is serialized as JSON with
//! `type` as a string tag so services in other languages can read it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat string-keyed payload carried by every envelope.
pub type Payload = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Lifecycle event kinds emitted by the user service.
///
/// New kinds are added as variants here and registered with a handler on
/// the consuming side; consumers that do not know a tag yet treat the
/// record as poison instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Deleted,
}

impl EventType {
    /// Every known event type, in declaration order.
    pub const ALL: [EventType; 2] = [EventType::Created, EventType::Deleted];

    /// The wire tag for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An envelope could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("subject key must not be empty")]
    EmptySubjectKey,
}

/// A record could not be turned back into an envelope.
///
/// Every variant is permanent: retrying the same bytes can never succeed.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event type {0:?}")]
    UnknownType(String),

    #[error("invalid envelope: {0}")]
    Invalid(#[from] EnvelopeError),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A domain event ready to travel through the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    subject_key: String,
    payload: Payload,
    timestamp: DateTime<Utc>,
}

/// Shape of an envelope on the wire, before validation.
///
/// `type` is kept as a plain string so an unknown tag can be told apart
/// from a structurally broken record.
#[derive(Deserialize)]
struct WireEnvelope {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    subject_key: String,
    #[serde(default)]
    payload: Payload,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build a new envelope with a fresh id and the current time.
    ///
    /// Rejects blank subject keys: they would collapse every such event onto
    /// one arbitrary partition and break per-subject ordering.
    pub fn new(
        event_type: EventType,
        subject_key: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, EnvelopeError> {
        let subject_key = subject_key.into();
        if subject_key.trim().is_empty() {
            return Err(EnvelopeError::EmptySubjectKey);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            subject_key,
            payload,
            timestamp: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn subject_key(&self) -> &str {
        &self.subject_key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up a single payload field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate an envelope from its wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        let event_type = wire.event_type.parse()?;
        if wire.subject_key.trim().is_empty() {
            return Err(EnvelopeError::EmptySubjectKey.into());
        }
        Ok(Self {
            id: wire.id,
            event_type,
            subject_key: wire.subject_key,
            payload: wire.payload,
            timestamp: wire.timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Side-effect handlers and the table that routes envelopes to them.
//!
//! Adding an event type means registering one more handler in a
//! [`HandlerRegistry`]; the dispatcher never branches on the type itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Envelope, EventType};

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// A handler could not complete its side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The side effect may succeed on a later attempt (transport outage,
    /// timeout, authentication failure). The record is not acknowledged.
    #[error("{event_type} for subject {subject_key} failed: {reason}")]
    Transient {
        subject_key: String,
        event_type: EventType,
        reason: String,
    },

    /// The envelope can never be handled (e.g. no address in the payload).
    /// The record is treated as poison.
    #[error("{event_type} for subject {subject_key} rejected: {reason}")]
    Rejected {
        subject_key: String,
        event_type: EventType,
        reason: String,
    },
}

impl HandlerError {
    pub fn transient(envelope: &Envelope, reason: impl Into<String>) -> Self {
        Self::Transient {
            subject_key: envelope.subject_key().to_string(),
            event_type: envelope.event_type(),
            reason: reason.into(),
        }
    }

    pub fn rejected(envelope: &Envelope, reason: impl Into<String>) -> Self {
        Self::Rejected {
            subject_key: envelope.subject_key().to_string(),
            event_type: envelope.event_type(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// Converts a decoded envelope into a concrete side effect.
///
/// Implementations run concurrently for different partitions, so they must
/// not hold unsynchronized shared state. They must also tolerate seeing the
/// same envelope more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Lookup table from event type to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn register(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        if self.handlers.insert(event_type, handler).is_some() {
            tracing::warn!(%event_type, "Replacing previously registered handler");
        }
        self
    }

    pub fn get(&self, event_type: EventType) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&event_type)
    }

    /// Registered event types, in wire-tag order.
    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

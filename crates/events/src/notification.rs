//! Lifecycle notification emails.
//!
//! [`NotificationHandler`] turns a CREATED or DELETED envelope into a
//! welcome or farewell email sent to the envelope's `address` field.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_core::names::PAYLOAD_ADDRESS;

use crate::delivery::email::{MailError, MailTransport};
use crate::envelope::{Envelope, EventType};
use crate::handler::{EventHandler, HandlerError};

/// Subject and body of one notification email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: &'static str,
    pub body: &'static str,
}

const WELCOME: EmailTemplate = EmailTemplate {
    subject: "Your account has been created",
    body: "Hello! Your account has been created successfully.",
};

const FAREWELL: EmailTemplate = EmailTemplate {
    subject: "Your account has been deleted",
    body: "Hello! Your account has been deleted.",
};

/// Template sent for each event type.
pub fn template_for(event_type: EventType) -> EmailTemplate {
    match event_type {
        EventType::Created => WELCOME,
        EventType::Deleted => FAREWELL,
    }
}

/// Sends the templated email for a lifecycle envelope.
///
/// One send per call; retries belong to the dispatcher.
#[derive(Clone)]
pub struct NotificationHandler {
    mailer: Arc<dyn MailTransport>,
    timeout: Duration,
}

impl NotificationHandler {
    pub fn new(mailer: Arc<dyn MailTransport>, timeout: Duration) -> Self {
        Self { mailer, timeout }
    }

    /// Send a mail outside of any event, with the same timeout as handled
    /// events.
    pub async fn send_direct(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        match tokio::time::timeout(self.timeout, self.mailer.send(to, subject, body)).await {
            Ok(Ok(())) => {
                tracing::info!(to, subject, "Direct notification sent");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(to, subject, error = %e, "Direct notification failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    to,
                    subject,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Direct notification timed out",
                );
                Err(MailError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let address = match envelope.field(PAYLOAD_ADDRESS) {
            Some(address) if !address.trim().is_empty() => address,
            _ => {
                return Err(HandlerError::rejected(
                    envelope,
                    format!("payload has no `{PAYLOAD_ADDRESS}`"),
                ))
            }
        };

        let template = template_for(envelope.event_type());
        let send = self.mailer.send(address, template.subject, template.body);
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(())) => {
                tracing::info!(
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    subject_key = %envelope.subject_key(),
                    "Notification email sent",
                );
                Ok(())
            }
            Ok(Err(e)) => Err(HandlerError::transient(envelope, e.to_string())),
            Err(_) => Err(HandlerError::transient(
                envelope,
                MailError::Timeout(self.timeout).to_string(),
            )),
        }
    }
}

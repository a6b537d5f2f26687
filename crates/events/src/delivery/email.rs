//! Mail transport over SMTP.
//!
//! [`MailTransport`] is the seam the notification handler sends through.
//! [`SmtpMailer`] implements it on top of the `lettre` async SMTP
//! transport, which is built once at startup and pools its own
//! connections, so a single mailer is shared by every partition worker.

use std::time::Duration;

use async_trait::async_trait;
use herald_core::config;
use herald_core::error::ConfigError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A mail could not be handed to the SMTP server.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),

    #[error("SMTP server did not answer within {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// MailTransport
// ---------------------------------------------------------------------------

/// Sends one plain-text mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "noreply@herald.local";

/// Default bound on one SMTP exchange.
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 10;

/// Configuration for [`SmtpMailer`].
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// RFC 5322 "From" address.
    pub from_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    /// Upgrade the connection with STARTTLS. Disable only for local relays.
    pub starttls: bool,
    /// Bound on one send, applied both by the transport and by the handler.
    pub timeout: Duration,
}

impl EmailConfig {
    pub fn new(smtp_host: impl Into<String>) -> Self {
        Self {
            smtp_host: smtp_host.into(),
            smtp_port: DEFAULT_SMTP_PORT,
            from_address: DEFAULT_FROM_ADDRESS.to_string(),
            smtp_user: None,
            smtp_password: None,
            starttls: true,
            timeout: Duration::from_secs(DEFAULT_SMTP_TIMEOUT_SECS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable            | Required | Default                |
    /// |---------------------|----------|------------------------|
    /// | `SMTP_HOST`         | yes      | —                      |
    /// | `SMTP_PORT`         | no       | `587`                  |
    /// | `SMTP_FROM`         | no       | `noreply@herald.local` |
    /// | `SMTP_USER`         | no       | —                      |
    /// | `SMTP_PASSWORD`     | no       | —                      |
    /// | `SMTP_STARTTLS`     | no       | `true`                 |
    /// | `SMTP_TIMEOUT_SECS` | no       | `10`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            smtp_host: config::required("SMTP_HOST")?,
            smtp_port: config::parse_or("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            from_address: config::optional("SMTP_FROM")
                .unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: config::optional("SMTP_USER"),
            smtp_password: config::optional("SMTP_PASSWORD"),
            starttls: config::flag_or("SMTP_STARTTLS", true)?,
            timeout: Duration::from_secs(config::parse_or(
                "SMTP_TIMEOUT_SECS",
                DEFAULT_SMTP_TIMEOUT_SECS,
            )?),
        })
    }
}

// ---------------------------------------------------------------------------
// SmtpMailer
// ---------------------------------------------------------------------------

/// [`MailTransport`] backed by an SMTP relay.
#[derive(Debug)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport. Does not connect; the first send does.
    pub fn new(config: &EmailConfig) -> Result<Self, MailError> {
        let from: Mailbox = config.from_address.parse()?;

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.timeout));

        if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        tracing::info!(
            smtp_host = %config.smtp_host,
            smtp_port = config.smtp_port,
            starttls = config.starttls,
            "SMTP mailer configured",
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport.send(message).await?;
        tracing::debug!(to, subject, "Mail accepted by SMTP server");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn from_env_requires_smtp_host() {
        std::env::remove_var("SMTP_HOST");
        assert_matches!(
            EmailConfig::from_env(),
            Err(ConfigError::Missing("SMTP_HOST"))
        );
    }

    #[test]
    fn new_config_uses_defaults() {
        let config = EmailConfig::new("smtp.example.com");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_address, "noreply@herald.local");
        assert!(config.starttls);
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn mail_error_display_build() {
        let err = MailError::Build("missing body".to_string());
        assert_eq!(err.to_string(), "Email build error: missing body");
    }

    #[tokio::test]
    async fn mailer_rejects_bad_sender_address() {
        let mut config = EmailConfig::new("localhost");
        config.from_address = "not-an-email".into();
        assert_matches!(SmtpMailer::new(&config), Err(MailError::Address(_)));
    }

    #[tokio::test]
    async fn mailer_builds_without_connecting() {
        let mut config = EmailConfig::new("localhost");
        config.starttls = false;
        config.smtp_port = 2525;
        assert!(SmtpMailer::new(&config).is_ok());
    }

    #[tokio::test]
    async fn bad_recipient_fails_before_transport() {
        let mut config = EmailConfig::new("localhost");
        config.starttls = false;
        let mailer = SmtpMailer::new(&config).unwrap();

        let result = mailer.send("not-an-email", "Hi", "body").await;
        assert_matches!(result, Err(MailError::Address(_)));
    }
}

//! External delivery channels for notifications.
//!
//! Only SMTP email is supported; handlers depend on the
//! [`MailTransport`](email::MailTransport) trait, not on the transport.

pub mod email;

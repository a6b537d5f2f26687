//! Well-known names shared between the producing and consuming services.
//!
//! Payload keys must match on both sides of the broker: the user service
//! writes them and the notification handler reads them.

/// Payload key carrying the subject's notification address.
pub const PAYLOAD_ADDRESS: &str = "address";


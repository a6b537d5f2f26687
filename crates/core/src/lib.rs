//! Shared building blocks for the herald services.
//!
//! - [`error`] — domain and configuration error types.
//! - [`config`] — environment variable helpers used by every `from_env()`.
//! - [`names`] — well-known payload keys and default identifiers.
//! - [`types`] — primitive type aliases.

pub mod config;
pub mod error;
pub mod names;
pub mod types;

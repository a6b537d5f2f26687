//! Environment variable helpers.
//!
//! Configuration is read once at startup. Required values that are absent
//! or blank surface as [`ConfigError::Missing`]; values that are present but
//! unparseable surface as [`ConfigError::Invalid`] rather than silently
//! falling back to a default.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

/// Read a variable that must be set to a non-blank value.
pub fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

/// Read a variable, treating blank values the same as unset ones.
pub fn optional(var: &'static str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, returning `default` when it is unset.
pub fn parse_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn flag_or(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional(var) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}

//! User entity model and DTOs.

use herald_core::error::CoreError;
use herald_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// A stored user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: DbId,
    pub name: String,
    /// Also the address lifecycle notifications are sent to.
    pub email: String,
    pub age: Option<i32>,
    pub created_at: Timestamp,
}

/// DTO for creating a new user.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUser {
    #[validate(custom(function = "not_blank", message = "User name is required"))]
    pub name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(range(min = 0, max = 150))]
    pub age: Option<i32>,
}

/// DTO for updating an existing user. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateUser {
    #[validate(custom(function = "not_blank", message = "User name is required"))]
    pub name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    #[validate(range(min = 0, max = 150))]
    pub age: Option<i32>,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Run `validator` checks and map failures to [`CoreError::Validation`].
pub fn validate_input(input: &impl Validate) -> Result<(), CoreError> {
    input
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))
}

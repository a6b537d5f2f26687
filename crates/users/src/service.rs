//! User operations and their lifecycle events.

use std::sync::Arc;

use herald_core::error::CoreError;
use herald_core::names::PAYLOAD_ADDRESS;
use herald_core::types::DbId;
use herald_events::{EventPublisher, EventType, Payload, PublishOutcome};

use crate::model::{validate_input, CreateUser, UpdateUser, User};
use crate::store::UserStore;

const ENTITY: &str = "User";

/// Commit first, then announce.
///
/// The publish step runs only after the store call returned, and its
/// outcome is logged and dropped: callers never see a publish failure.
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
    events: EventPublisher,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, input: CreateUser) -> Result<User, CoreError> {
        validate_input(&input)?;
        let user = self.store.insert(&input).await?;
        tracing::info!(user_id = user.id, "User created");

        self.announce(EventType::Created, &user).await;
        Ok(user)
    }

    pub async fn get(&self, id: DbId) -> Result<User, CoreError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(CoreError::NotFound { entity: ENTITY, id })
    }

    /// All users; empty when there are none.
    pub async fn list(&self) -> Result<Vec<User>, CoreError> {
        self.store.list().await
    }

    /// Update profile fields. Updates are not announced.
    pub async fn update(&self, id: DbId, input: UpdateUser) -> Result<User, CoreError> {
        validate_input(&input)?;
        let user = self
            .store
            .update(id, &input)
            .await?
            .ok_or(CoreError::NotFound { entity: ENTITY, id })?;
        tracing::info!(user_id = id, "User updated");
        Ok(user)
    }

    pub async fn delete(&self, id: DbId) -> Result<(), CoreError> {
        let user = self
            .store
            .delete(id)
            .await?
            .ok_or(CoreError::NotFound { entity: ENTITY, id })?;
        tracing::info!(user_id = id, "User deleted");

        self.announce(EventType::Deleted, &user).await;
        Ok(())
    }

    async fn announce(&self, event_type: EventType, user: &User) {
        let payload = Payload::from([(PAYLOAD_ADDRESS.to_string(), user.email.clone())]);
        let outcome = self
            .events
            .publish(event_type, &user.id.to_string(), payload)
            .await;
        if let PublishOutcome::Warning(e) = outcome {
            // Already logged by the publisher; the user change stands.
            tracing::debug!(user_id = user.id, %event_type, error = %e, "Lifecycle event dropped");
        }
    }
}

//! Persistence for users.
//!
//! A successful return from any mutating [`UserStore`] method means the
//! change is committed; the service publishes events only after that.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use herald_core::error::CoreError;
use herald_core::types::DbId;
use tokio::sync::RwLock;

use crate::model::{CreateUser, UpdateUser, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user, returning the created row.
    async fn insert(&self, input: &CreateUser) -> Result<User, CoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<User>, CoreError>;

    /// All users, ordered by id.
    async fn list(&self) -> Result<Vec<User>, CoreError>;

    /// Apply the non-`None` fields of `input`. Returns `None` if no user
    /// with `id` exists.
    async fn update(&self, id: DbId, input: &UpdateUser) -> Result<Option<User>, CoreError>;

    /// Remove a user, returning the removed row.
    async fn delete(&self, id: DbId) -> Result<Option<User>, CoreError>;
}

#[derive(Default)]
struct Table {
    last_id: DbId,
    rows: HashMap<DbId, User>,
}

impl Table {
    fn email_taken(&self, email: &str, except: Option<DbId>) -> bool {
        self.rows
            .values()
            .any(|u| Some(u.id) != except && u.email.eq_ignore_ascii_case(email))
    }
}

/// Process-local [`UserStore`]. Ids are assigned monotonically and never
/// reused.
#[derive(Default)]
pub struct InMemoryUserStore {
    table: RwLock<Table>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, input: &CreateUser) -> Result<User, CoreError> {
        let mut table = self.table.write().await;
        if table.email_taken(&input.email, None) {
            return Err(CoreError::Conflict(format!(
                "email {} is already registered",
                input.email
            )));
        }
        table.last_id += 1;
        let user = User {
            id: table.last_id,
            name: input.name.trim().to_string(),
            email: input.email.clone(),
            age: input.age,
            created_at: Utc::now(),
        };
        table.rows.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<User>, CoreError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<User>, CoreError> {
        let mut users: Vec<User> = self.table.read().await.rows.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn update(&self, id: DbId, input: &UpdateUser) -> Result<Option<User>, CoreError> {
        let mut table = self.table.write().await;
        if let Some(email) = &input.email {
            if table.email_taken(email, Some(id)) {
                return Err(CoreError::Conflict(format!(
                    "email {email} is already registered"
                )));
            }
        }
        let Some(user) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = &input.name {
            user.name = name.trim().to_string();
        }
        if let Some(email) = &input.email {
            user.email = email.clone();
        }
        if input.age.is_some() {
            user.age = input.age;
        }
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: DbId) -> Result<Option<User>, CoreError> {
        Ok(self.table.write().await.rows.remove(&id))
    }
}

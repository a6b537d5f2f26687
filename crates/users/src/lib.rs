//! User records and the lifecycle events they emit.
//!
//! [`UserService`] owns the create/read/update/delete flow. Every change
//! is committed to the [`UserStore`] first; CREATED and DELETED events are
//! published afterwards on a best-effort basis, so a broker outage never
//! fails or rolls back a user operation.

pub mod model;
pub mod service;
pub mod store;

pub use model::{CreateUser, UpdateUser, User};
pub use service::UserService;
pub use store::{InMemoryUserStore, UserStore};

//! User records behind a remote database with a JSON-file fallback.
//!
//! The backend is picked per operation from the remote store's cached
//! connectivity flag, kept current by a background monitor. The two
//! backends are never synchronised: records created in one mode are not
//! visible from the other.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

pub mod file;
pub mod postgres;

pub use file::FileUserStore;
pub use postgres::PgUserStore;

/// A stored account. `password` is always a bcrypt hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(rename = "password")]
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields supplied by the caller; the backend assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: Option<String>,
    pub google_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("username or email already exists")]
    Conflict,
    #[error("store operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the email or username is taken.
    async fn create(&self, user: NewUser) -> Result<UserRecord, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Remote,
    Fallback,
}

pub struct IdentityStore {
    remote: Option<PgUserStore>,
    fallback: FileUserStore,
}

impl IdentityStore {
    pub fn new(remote: Option<PgUserStore>, fallback: FileUserStore) -> Self {
        Self { remote, fallback }
    }

    /// Returns the backend for one whole operation. Callers hold on to the
    /// returned backend so every step of an operation sees the same store.
    /// Reads the last known connectivity and never waits on the network.
    pub fn backend(&self) -> (StoreMode, &dyn UserBackend) {
        if let Some(remote) = &self.remote {
            if remote.is_connected() {
                return (StoreMode::Remote, remote as &dyn UserBackend);
            }
            debug!("remote store unreachable; using fallback");
        }
        (StoreMode::Fallback, &self.fallback as &dyn UserBackend)
    }

    pub fn mode(&self) -> StoreMode {
        self.backend().0
    }
}

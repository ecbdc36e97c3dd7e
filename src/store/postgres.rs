use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{NewUser, StoreError, UserBackend, UserRecord};

const USER_COLUMNS: &str = "id, username, email, password_hash, avatar, google_id, created_at";

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    avatar: Option<String>,
    google_id: Option<String>,
    created_at: OffsetDateTime,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id.to_string(),
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            avatar: row.avatar,
            google_id: row.google_id,
            created_at: row.created_at,
        }
    }
}

/// Remote user table. Every call is bounded by `timeout`.
///
/// `connected` is the cached connectivity flag read on the request path. It
/// is refreshed by [`PgUserStore::spawn_monitor`] and cleared as soon as a
/// query fails at the connection level.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
    timeout: Duration,
    connected: Arc<AtomicBool>,
}

impl PgUserStore {
    /// Builds a lazily connecting pool so an unreachable database at startup
    /// only pushes operations onto the fallback store.
    pub fn connect_lazy(database_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(timeout)
            .connect_lazy(database_url)?;
        Ok(Self {
            pool,
            timeout,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Last known connectivity. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::Relaxed);
        if was != up {
            if up {
                info!("database reachable; using remote store");
            } else {
                warn!("database unreachable; using fallback store");
            }
        }
    }

    /// Tries the pool, bounded by the I/O timeout, and records the result.
    pub async fn refresh_connectivity(&self) -> bool {
        let up = matches!(
            tokio::time::timeout(self.timeout, self.pool.acquire()).await,
            Ok(Ok(_))
        );
        self.set_connected(up);
        up
    }

    /// Re-checks the database every `every` in the background.
    pub fn spawn_monitor(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.refresh_connectivity().await;
            }
        })
    }

    async fn bounded<T>(
        &self,
        query: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                if matches!(
                    e,
                    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
                ) {
                    self.set_connected(false);
                }
                Err(e.into())
            }
            Err(_) => {
                self.set_connected(false);
                Err(StoreError::Timeout)
            }
        }
    }

    async fn find_one(&self, filter: &str, value: &str) -> Result<Option<UserRecord>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {filter}");
        let row = self
            .bounded(
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(value)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(UserRecord::from))
    }
}

#[async_trait]
impl UserBackend for PgUserStore {
    async fn create(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO users (username, email, password_hash, avatar, google_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        );
        let res = self
            .bounded(
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(&user.username)
                    .bind(&user.email)
                    .bind(&user.password_hash)
                    .bind(&user.avatar)
                    .bind(&user.google_id)
                    .fetch_one(&self.pool),
            )
            .await;

        match res {
            Ok(row) => {
                debug!(user_id = %row.id, "user stored in database");
                Ok(row.into())
            }
            Err(StoreError::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                Err(StoreError::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        // Rows written before emails were normalised may carry upper case.
        self.find_one("lower(email) = lower($1)", email).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        self.find_one("username = $1", username).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        // Ids minted by the fallback store are not UUIDs and never live here.
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = self
            .bounded(
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(UserRecord::from))
    }
}

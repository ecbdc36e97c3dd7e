use std::path::{Path, PathBuf};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::{io::AsyncWriteExt, sync::RwLock};
use tracing::{debug, info, warn};

use super::{NewUser, StoreError, UserBackend, UserRecord};

/// In-process user list mirrored to a JSON file.
///
/// Durability is best-effort: a failed flush is logged and the in-memory copy
/// stays authoritative until the process exits.
pub struct FileUserStore {
    path: PathBuf,
    users: RwLock<Vec<UserRecord>>,
}

impl FileUserStore {
    /// Loads the mirror file. A missing file starts empty; an unreadable one is
    /// logged and also starts empty. A corrupt one is moved aside to
    /// `<file>.corrupt` before starting empty so the next flush cannot
    /// destroy it.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => match serde_json::from_str::<Vec<UserRecord>>(&raw) {
                Ok(users) => {
                    info!(path = %path.display(), count = users.len(), "loaded users file");
                    users
                }
                Err(e) => {
                    let backup = sibling(&path, ".corrupt");
                    match std::fs::rename(&path, &backup) {
                        Ok(()) => warn!(
                            error = %e,
                            path = %path.display(),
                            backup = %backup.display(),
                            "users file is corrupt; moved aside, starting empty"
                        ),
                        Err(mv) => warn!(
                            error = %e,
                            rename_error = %mv,
                            path = %path.display(),
                            "users file is corrupt and could not be moved aside; starting empty"
                        ),
                    }
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no users file yet");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "error loading users file; starting empty");
                Vec::new()
            }
        };
        Self {
            path,
            users: RwLock::new(users),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, users: &[UserRecord]) {
        if let Err(e) = write_atomic(&self.path, users).await {
            warn!(error = %e, path = %self.path.display(), "error saving users file; keeping in-memory copy");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes a sibling temp file, syncs it, and renames it over the target so a
/// crash mid-write never leaves a truncated mirror.
async fn write_atomic(path: &Path, users: &[UserRecord]) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(users)?;
    let tmp = sibling(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Creation time in Unix milliseconds, bumped past any id already taken.
fn next_id(users: &[UserRecord], now: OffsetDateTime) -> String {
    let mut millis = now.unix_timestamp_nanos() / 1_000_000;
    loop {
        let candidate = millis.to_string();
        if !users.iter().any(|u| u.id == candidate) {
            return candidate;
        }
        millis += 1;
    }
}

#[async_trait]
impl UserBackend for FileUserStore {
    async fn create(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let mut users = self.users.write().await;
        if users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email) || u.username == user.username)
        {
            return Err(StoreError::Conflict);
        }

        let now = OffsetDateTime::now_utc();
        let record = UserRecord {
            id: next_id(&users, now),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            avatar: user.avatar,
            google_id: user.google_id,
            created_at: now,
        };
        users.push(record.clone());
        // Flushed under the write lock so file order matches memory order.
        self.persist(&users).await;
        debug!(user_id = %record.id, "user stored in fallback file");
        Ok(record)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.username == username).cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == id).cloned())
    }
}

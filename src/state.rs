use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    auth::google::{GoogleVerifier, IdTokenVerifier},
    config::AppConfig,
    store::{FileUserStore, IdentityStore, PgUserStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<IdentityStore>,
    pub google: Arc<dyn IdTokenVerifier>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let fallback = FileUserStore::load(&config.users_file);
        info!(path = %fallback.path().display(), "fallback store ready");

        let remote = match &config.database_url {
            Some(url) => {
                let remote = PgUserStore::connect_lazy(url, config.io_timeout)?;
                if remote.refresh_connectivity().await {
                    if let Err(e) = sqlx::migrate!("./migrations").run(remote.pool()).await {
                        warn!(error = %e, "migration failed; continuing");
                    }
                } else {
                    warn!("running in fallback mode until the database returns");
                }
                remote.spawn_monitor(config.db_check_interval);
                Some(remote)
            }
            None => {
                warn!("DATABASE_URL not set; accounts live only in the fallback store");
                None
            }
        };

        let google = Arc::new(GoogleVerifier::new(&config.google, config.io_timeout))
            as Arc<dyn IdTokenVerifier>;

        Ok(Self::from_parts(
            config,
            Arc::new(IdentityStore::new(remote, fallback)),
            google,
        ))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<IdentityStore>,
        google: Arc<dyn IdTokenVerifier>,
    ) -> Self {
        Self {
            config,
            store,
            google,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        auth::google::{ExternalIdentity, VerifyError},
        config::{GoogleConfig, JwtConfig},
        store::UserRecord,
    };

    /// Accepts tokens of the form `google|<sub>|<email>|<name>`.
    struct FakeGoogle;

    #[async_trait]
    impl IdTokenVerifier for FakeGoogle {
        async fn verify(&self, id_token: &str) -> Result<ExternalIdentity, VerifyError> {
            match id_token.split('|').collect::<Vec<_>>().as_slice() {
                ["google", sub, email, name] => Ok(ExternalIdentity {
                    subject: sub.to_string(),
                    email: email.to_string(),
                    name: Some(name.to_string()),
                    picture: Some("https://img.example/jane.png".into()),
                }),
                _ => Err(VerifyError::InvalidToken("fake verifier rejected token".into())),
            }
        }
    }

    pub fn google_token(sub: &str, email: &str, name: &str) -> String {
        format!("google|{sub}|{email}|{name}")
    }

    /// Fallback-only state over a scratch directory. Keep the directory
    /// alive for the duration of the test.
    pub fn fake_state() -> (tempfile::TempDir, AppState) {
        fake_state_with_users(&[])
    }

    /// Like [`fake_state`], with `users` already present in the users file.
    pub fn fake_state_with_users(users: &[UserRecord]) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let users_file = dir.path().join("users.json");
        if !users.is_empty() {
            let body = serde_json::to_vec_pretty(users).expect("serialize users");
            std::fs::write(&users_file, body).expect("seed users file");
        }
        let config = Arc::new(AppConfig {
            database_url: None,
            users_file: users_file.clone(),
            io_timeout: Duration::from_secs(5),
            db_check_interval: Duration::from_secs(10),
            jwt: JwtConfig {
                secret: "test-secret-test-secret-test-secret".into(),
            },
            google: GoogleConfig {
                client_id: Some("test-client".into()),
                certs_url: "http://127.0.0.1:1/certs".into(),
            },
        });
        let store = Arc::new(IdentityStore::new(None, FileUserStore::load(users_file)));
        let state = AppState::from_parts(config, store, Arc::new(FakeGoogle));
        (dir, state)
    }
}

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Signing secret shipped as a fallback by earlier deployments. Never accepted.
const KNOWN_DEFAULT_SECRET: &str = "ganzakmk";
const MIN_SECRET_LENGTH: usize = 32;

pub const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    /// `None` disables federated sign-in; requests fail closed.
    pub client_id: Option<String>,
    pub certs_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `None` runs the service on the fallback store only.
    pub database_url: Option<String>,
    pub users_file: PathBuf,
    pub io_timeout: Duration,
    /// How often the database connectivity flag is refreshed.
    pub db_check_interval: Duration,
    pub jwt: JwtConfig,
    pub google: GoogleConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        validate_secret(&secret)?;

        let jwt = JwtConfig { secret };

        let client_id = non_empty_var("GOOGLE_CLIENT_ID");
        if client_id.is_none() {
            tracing::warn!("GOOGLE_CLIENT_ID not set; google sign-in is disabled");
        }
        let google = GoogleConfig {
            client_id,
            certs_url: non_empty_var("GOOGLE_CERTS_URL")
                .unwrap_or_else(|| GOOGLE_CERTS_URL.into()),
        };

        Ok(Self {
            database_url: non_empty_var("DATABASE_URL"),
            users_file: non_empty_var("USERS_FILE")
                .unwrap_or_else(|| "users.json".into())
                .into(),
            io_timeout: Duration::from_secs(secs_var("IO_TIMEOUT_SECS", 5)),
            db_check_interval: Duration::from_secs(secs_var("DB_CHECK_INTERVAL_SECS", 10)),
            jwt,
            google,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Rejects signing secrets that are short or publicly known.
pub fn validate_secret(secret: &str) -> anyhow::Result<()> {
    if secret == KNOWN_DEFAULT_SECRET {
        bail!("JWT_SECRET is set to a publicly known default; refusing to start");
    }
    if secret.len() < MIN_SECRET_LENGTH {
        bail!(
            "JWT_SECRET must be at least {} bytes, got {}",
            MIN_SECRET_LENGTH,
            secret.len()
        );
    }
    Ok(())
}

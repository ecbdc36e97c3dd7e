//! Google ID token verification against Google's published signing keys.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::GoogleConfig;

const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// How long fetched signing keys are reused.
const KEYS_TTL: Duration = Duration::from_secs(60 * 60);
/// An unknown key id refetches only when the cached set is at least this old.
const KEYS_REFETCH_COOLDOWN: Duration = Duration::from_secs(30);

/// Identity asserted by a verified external ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("google sign-in is not configured")]
    NotConfigured,
    #[error("failed to fetch signing keys: {0}")]
    Keys(String),
    #[error("invalid id token: {0}")]
    InvalidToken(String),
}

#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<ExternalIdentity, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

struct CachedKeys {
    fetched_at: Instant,
    keys: Vec<Jwk>,
}

pub struct GoogleVerifier {
    http: reqwest::Client,
    client_id: Option<String>,
    certs_url: String,
    timeout: Duration,
    keys: RwLock<Option<CachedKeys>>,
}

impl GoogleVerifier {
    pub fn new(cfg: &GoogleConfig, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: cfg.client_id.clone(),
            certs_url: cfg.certs_url.clone(),
            timeout,
            keys: RwLock::new(None),
        }
    }

    /// Looks `kid` up in the cached key set, refetching when the set is
    /// stale or, after a short cooldown, when the key is unknown (rotation).
    async fn signing_key(&self, kid: &str) -> Result<Jwk, VerifyError> {
        {
            let cached = self.keys.read().await;
            if let Some(c) = cached.as_ref() {
                let age = c.fetched_at.elapsed();
                if age < KEYS_TTL {
                    if let Some(k) = c.keys.iter().find(|k| k.kid == kid) {
                        return Ok(k.clone());
                    }
                    if age < KEYS_REFETCH_COOLDOWN {
                        return Err(VerifyError::InvalidToken(format!("unknown key id {kid}")));
                    }
                }
            }
        }

        let mut cached = self.keys.write().await;
        // Another request may have refreshed the set while we waited.
        if let Some(c) = cached.as_ref() {
            if c.fetched_at.elapsed() < KEYS_REFETCH_COOLDOWN {
                return c
                    .keys
                    .iter()
                    .find(|k| k.kid == kid)
                    .cloned()
                    .ok_or_else(|| VerifyError::InvalidToken(format!("unknown key id {kid}")));
            }
        }
        let keys = self.fetch_keys().await?;
        let found = keys.iter().find(|k| k.kid == kid).cloned();
        *cached = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys,
        });
        found.ok_or_else(|| VerifyError::InvalidToken(format!("unknown key id {kid}")))
    }

    async fn fetch_keys(&self) -> Result<Vec<Jwk>, VerifyError> {
        debug!(url = %self.certs_url, "fetching google signing keys");
        let response = self
            .http
            .get(&self.certs_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| VerifyError::Keys(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VerifyError::Keys(format!(
                "certs request failed: {}",
                response.status()
            )));
        }

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| VerifyError::Keys(e.to_string()))?;
        Ok(jwks.keys)
    }
}

#[async_trait]
impl IdTokenVerifier for GoogleVerifier {
    async fn verify(&self, id_token: &str) -> Result<ExternalIdentity, VerifyError> {
        let client_id = self.client_id.as_deref().ok_or(VerifyError::NotConfigured)?;

        let header =
            decode_header(id_token).map_err(|e| VerifyError::InvalidToken(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::InvalidToken(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::InvalidToken("missing key id".into()))?;

        let jwk = self.signing_key(&kid).await?;
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| VerifyError::Keys(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.set_audience(&[client_id]);

        let claims = decode::<GoogleClaims>(id_token, &key, &validation)
            .map_err(|e| {
                error!(error = %e, "google id token rejected");
                VerifyError::InvalidToken(e.to_string())
            })?
            .claims;

        if claims.email_verified == Some(false) {
            return Err(VerifyError::InvalidToken("email not verified".into()));
        }
        let email = claims
            .email
            .ok_or_else(|| VerifyError::InvalidToken("missing email claim".into()))?;

        info!(sub = %claims.sub, "google id token verified");
        Ok(ExternalIdentity {
            subject: claims.sub,
            email,
            name: claims.name,
            picture: claims.picture,
        })
    }
}

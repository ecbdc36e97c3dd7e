use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{present, GoogleRequest, LoginRequest, PublicUser, SignupRequest},
        google::ExternalIdentity,
        jwt::JwtKeys,
        password::{self, hash_password, unusable_password_hash, verify_password},
    },
    error::AuthError,
    state::AppState,
    store::{NewUser, StoreError, UserBackend, UserRecord},
};

/// A successful authentication: the public user plus a fresh bearer token.
#[derive(Debug)]
pub struct Session {
    pub user: PublicUser,
    pub token: String,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Passwords are checked for presence but never trimmed.
fn present_password(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|p| !p.trim().is_empty())
}

fn issue_token(st: &AppState, user_id: &str) -> Result<String, AuthError> {
    JwtKeys::from_ref(st)
        .sign(user_id)
        .map_err(|e| AuthError::Internal(e.into()))
}

#[instrument(skip(st, req))]
pub async fn signup(st: &AppState, req: SignupRequest) -> Result<Session, AuthError> {
    let (Some(username), Some(email), Some(plain)) = (
        present(&req.username),
        present(&req.email),
        present_password(&req.password),
    ) else {
        warn!("signup with missing fields");
        return Err(AuthError::BadRequest("All fields are required"));
    };
    let email = email.to_lowercase();
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::BadRequest("Invalid email"));
    }

    let (mode, users) = st.store.backend();
    if users.find_by_email(&email).await?.is_some()
        || users.find_by_username(username).await?.is_some()
    {
        warn!(email = %email, username, "username or email already exists");
        return Err(AuthError::Conflict);
    }

    let plain = plain.to_owned();
    let hash = password::blocking(move || hash_password(&plain))
        .await
        .map_err(AuthError::Internal)?;

    let user = users
        .create(NewUser {
            username: username.to_owned(),
            email,
            password_hash: hash,
            avatar: None,
            google_id: None,
        })
        .await?;
    let token = issue_token(st, &user.id)?;

    info!(user_id = %user.id, email = %user.email, store = ?mode, "user registered");
    Ok(Session {
        user: PublicUser {
            username: user.username,
            email: user.email,
            avatar: None,
        },
        token,
    })
}

#[instrument(skip(st, req))]
pub async fn login(st: &AppState, req: LoginRequest) -> Result<Session, AuthError> {
    let (Some(email), Some(plain)) = (present(&req.email), present_password(&req.password)) else {
        warn!("login with missing fields");
        return Err(AuthError::BadRequest("Email and password are required"));
    };
    let email = email.to_lowercase();

    let (mode, users) = st.store.backend();
    let user = match users.find_by_email(&email).await? {
        Some(u) => u,
        None => {
            warn!(email = %email, "login unknown email");
            return Err(AuthError::NotFound);
        }
    };

    let plain = plain.to_owned();
    let hash = user.password_hash.clone();
    let ok = password::blocking(move || verify_password(&plain, &hash))
        .await
        .map_err(AuthError::Internal)?;
    if !ok {
        warn!(email = %email, user_id = %user.id, "login invalid password");
        return Err(AuthError::InvalidCredentials);
    }

    let token = issue_token(st, &user.id)?;
    info!(user_id = %user.id, email = %user.email, store = ?mode, "user logged in");
    Ok(Session {
        user: PublicUser {
            username: user.username,
            email: user.email,
            avatar: None,
        },
        token,
    })
}

/// Accepts the raw `Authorization` header value.
#[instrument(skip_all)]
pub async fn validate(st: &AppState, authorization: Option<&str>) -> Result<(), AuthError> {
    let token = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Unauthorized("No token provided"))?;

    let user_id = JwtKeys::from_ref(st).verify(token).map_err(|e| {
        warn!(error = %e, "invalid token");
        AuthError::Unauthorized("Invalid token")
    })?;

    let (_, users) = st.store.backend();
    if users.find_by_id(&user_id).await?.is_none() {
        warn!(user_id = %user_id, "token subject no longer exists");
        return Err(AuthError::Unauthorized("User not found"));
    }
    Ok(())
}

#[instrument(skip(st, req))]
pub async fn google_sign_in(st: &AppState, req: GoogleRequest) -> Result<Session, AuthError> {
    let Some(id_token) = present(&req.token) else {
        warn!("google sign-in without token");
        return Err(AuthError::BadRequest("Google token is required"));
    };

    let identity = st.google.verify(id_token).await.map_err(|e| {
        error!(error = %e, "google verification failed");
        AuthError::AuthFailed
    })?;
    let email = identity.email.trim().to_lowercase();

    let (mode, users) = st.store.backend();
    let user = match users.find_by_email(&email).await? {
        Some(u) => u,
        None => create_federated_user(users, &identity, email).await?,
    };

    let token = issue_token(st, &user.id)?;
    info!(user_id = %user.id, email = %user.email, store = ?mode, "google sign-in");
    Ok(Session {
        user: PublicUser {
            username: user.username,
            email: user.email,
            avatar: user.avatar.or(identity.picture),
        },
        token,
    })
}

async fn create_federated_user(
    users: &dyn UserBackend,
    identity: &ExternalIdentity,
    email: String,
) -> Result<UserRecord, AuthError> {
    let short = federated_username(identity.name.as_deref(), short_suffix(&identity.subject));
    // Same display name and same last four digits: fall back to the whole
    // subject id, which is unique per provider account.
    let username = if users.find_by_username(&short).await?.is_some() {
        federated_username(identity.name.as_deref(), &identity.subject)
    } else {
        short
    };

    let hash = password::blocking(unusable_password_hash)
        .await
        .map_err(AuthError::Internal)?;

    let created = users
        .create(NewUser {
            username,
            email: email.clone(),
            password_hash: hash,
            avatar: identity.picture.clone(),
            google_id: Some(identity.subject.clone()),
        })
        .await;

    match created {
        Ok(user) => {
            info!(user_id = %user.id, username = %user.username, "created user from google identity");
            Ok(user)
        }
        // Lost a race with a concurrent sign-in for the same email.
        Err(StoreError::Conflict) => users
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::Conflict),
        Err(e) => Err(e.into()),
    }
}

/// Display name lower-cased with whitespace removed, plus `suffix`.
pub(crate) fn federated_username(name: Option<&str>, suffix: &str) -> String {
    let base: String = name
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    let base = if base.is_empty() { "user".to_string() } else { base };
    format!("{base}{suffix}")
}

/// Last four characters of the subject id.
fn short_suffix(subject: &str) -> &str {
    subject
        .char_indices()
        .rev()
        .nth(3)
        .map_or(subject, |(i, _)| &subject[i..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::jwt::Claims,
        state::test_support::{fake_state, fake_state_with_users, google_token},
    };
    use time::OffsetDateTime;

    fn signup_req(username: &str, email: &str, password: &str) -> SignupRequest {
        SignupRequest {
            username: Some(username.into()),
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {token}")
    }

    #[test]
    fn username_is_squashed_display_name_plus_suffix() {
        assert_eq!(federated_username(Some("Jane  Q Doe"), "4321"), "janeqdoe4321");
        assert_eq!(federated_username(None, "4321"), "user4321");
        assert_eq!(federated_username(Some("   "), "4321"), "user4321");
        assert_eq!(short_suffix("109876543210987654321"), "4321");
        assert_eq!(short_suffix("12"), "12");
    }

    #[test]
    fn email_shape_is_checked() {
        assert!(is_valid_email("a@x.com"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@x"));
    }

    #[tokio::test]
    async fn signup_once_then_conflict() {
        let (_dir, st) = fake_state();
        let session = signup(&st, signup_req("alice", "a@x.com", "pw123456"))
            .await
            .expect("first signup");
        assert_eq!(session.user.username, "alice");
        assert!(!session.token.is_empty());

        let same_email = signup(&st, signup_req("alice2", "A@X.com", "pw123456")).await;
        assert!(matches!(same_email, Err(AuthError::Conflict)));
        let same_name = signup(&st, signup_req("alice", "b@x.com", "pw123456")).await;
        assert!(matches!(same_name, Err(AuthError::Conflict)));
    }

    #[tokio::test]
    async fn signup_requires_all_fields() {
        let (_dir, st) = fake_state();
        let err = signup(
            &st,
            SignupRequest {
                username: Some("alice".into()),
                email: Some("a@x.com".into()),
                password: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::BadRequest("All fields are required")));

        let err = signup(&st, signup_req("alice", "nope", "pw123456")).await.unwrap_err();
        assert!(matches!(err, AuthError::BadRequest("Invalid email")));
    }

    #[tokio::test]
    async fn login_checks_password() {
        let (_dir, st) = fake_state();
        signup(&st, signup_req("alice", "a@x.com", "pw123456")).await.unwrap();

        let wrong = login(&st, login_req("a@x.com", "wrong")).await;
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

        let ok = login(&st, login_req(" A@x.com ", "pw123456")).await.expect("login");
        assert_eq!(ok.user.username, "alice");

        let unknown = login(&st, login_req("b@x.com", "pw123456")).await;
        assert!(matches!(unknown, Err(AuthError::NotFound)));

        let missing = login(&st, LoginRequest::default()).await;
        assert!(matches!(missing, Err(AuthError::BadRequest(_))));
    }

    #[tokio::test]
    async fn issued_token_validates() {
        let (_dir, st) = fake_state();
        let session = signup(&st, signup_req("alice", "a@x.com", "pw123456")).await.unwrap();
        validate(&st, Some(&bearer(&session.token))).await.expect("valid");

        let err = validate(&st, Some("garbage")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized("No token provided")));
        let err = validate(&st, Some("Bearer garbage")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized("Invalid token")));
        let err = validate(&st, None).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (_dir, st) = fake_state();
        let session = signup(&st, signup_req("alice", "a@x.com", "pw123456")).await.unwrap();
        let (_, users) = st.store.backend();
        let stored = users.find_by_email("a@x.com").await.unwrap().unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp() as usize;
        let stale = JwtKeys::from_ref(&st)
            .sign_claims(&Claims {
                id: stored.id,
                iat: now - 7200,
                exp: now - 3600,
            })
            .unwrap();

        let err = validate(&st, Some(&bearer(&stale))).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized("Invalid token")));
        validate(&st, Some(&bearer(&session.token))).await.expect("fresh token still valid");
    }

    #[tokio::test]
    async fn legacy_mixed_case_email_logs_in_and_blocks_duplicates() {
        let legacy = UserRecord {
            id: "1690000000000".into(),
            username: "alice".into(),
            email: "Alice@X.com".into(),
            password_hash: hash_password("pw123456").unwrap(),
            avatar: None,
            google_id: None,
            created_at: OffsetDateTime::from_unix_timestamp(1_690_000_000).unwrap(),
        };
        let (_dir, st) = fake_state_with_users(&[legacy]);

        let ok = login(&st, login_req("alice@x.com", "pw123456")).await.expect("login");
        assert_eq!(ok.user.username, "alice");
        assert_eq!(ok.user.email, "Alice@X.com");

        let dup = signup(&st, signup_req("alice2", "ALICE@x.com", "pw123456")).await;
        assert!(matches!(dup, Err(AuthError::Conflict)));
    }

    #[tokio::test]
    async fn token_for_unknown_subject_is_rejected() {
        let (_dir, st) = fake_state();
        let token = JwtKeys::from_ref(&st).sign("no-such-user").unwrap();
        let err = validate(&st, Some(&bearer(&token))).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized("User not found")));
    }

    #[tokio::test]
    async fn google_sign_in_creates_once_and_reuses() {
        let (_dir, st) = fake_state();
        let req = || GoogleRequest {
            token: Some(google_token("109876543210987654321", "jane@example.com", "Jane Doe")),
        };

        let first = google_sign_in(&st, req()).await.expect("first sign-in");
        assert_eq!(first.user.username, "janedoe4321");
        assert_eq!(first.user.avatar.as_deref(), Some("https://img.example/jane.png"));

        let second = google_sign_in(&st, req()).await.expect("second sign-in");
        assert_eq!(second.user.username, first.user.username);

        let (_, users) = st.store.backend();
        let stored = users.find_by_email("jane@example.com").await.unwrap().unwrap();
        assert_eq!(stored.google_id.as_deref(), Some("109876543210987654321"));
        validate(&st, Some(&bearer(&second.token))).await.expect("valid");
    }

    #[tokio::test]
    async fn google_username_collision_uses_full_subject() {
        let (_dir, st) = fake_state();
        google_sign_in(
            &st,
            GoogleRequest {
                token: Some(google_token("111110000004321", "jane1@example.com", "Jane Doe")),
            },
        )
        .await
        .unwrap();

        let other = google_sign_in(
            &st,
            GoogleRequest {
                token: Some(google_token("222220000004321", "jane2@example.com", "Jane Doe")),
            },
        )
        .await
        .expect("second jane");
        assert_eq!(other.user.username, "janedoe222220000004321");
    }

    #[tokio::test]
    async fn google_account_cannot_log_in_with_password() {
        let (_dir, st) = fake_state();
        google_sign_in(
            &st,
            GoogleRequest {
                token: Some(google_token("109876543210987654321", "jane@example.com", "Jane")),
            },
        )
        .await
        .unwrap();
        let res = login(&st, login_req("jane@example.com", "anything")).await;
        assert!(matches!(res, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn google_failures_map_to_auth_failed() {
        let (_dir, st) = fake_state();
        let err = google_sign_in(&st, GoogleRequest { token: Some("forged".into()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthFailed));

        let err = google_sign_in(&st, GoogleRequest::default()).await.unwrap_err();
        assert!(matches!(err, AuthError::BadRequest("Google token is required")));
    }
}

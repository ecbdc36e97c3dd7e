use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, GoogleRequest, LoginRequest, SignupRequest, ValidateResponse},
        services::{self, Session},
    },
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/validate", get(validate))
        .route("/auth/google", post(google))
}

/// Unwraps a JSON body, turning malformed input into a bad request.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload.map(|Json(v)| v).map_err(|e| {
        warn!(error = %e, "rejected request body");
        AuthError::BadRequest("Invalid request body")
    })
}

fn respond(message: &'static str, session: Session) -> Json<AuthResponse> {
    Json(AuthResponse {
        message,
        user: session.user,
        token: session.token,
    })
}

#[instrument(skip_all)]
pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AuthError> {
    let session = services::signup(&state, body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        respond("User created successfully", session),
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthError> {
    let session = services::login(&state, body(payload)?).await?;
    Ok(respond("Login successful", session))
}

#[instrument(skip_all)]
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ValidateResponse>, AuthError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    services::validate(&state, authorization).await?;
    Ok(Json(ValidateResponse {
        valid: true,
        message: "Token is valid",
    }))
}

#[instrument(skip_all)]
pub async fn google(
    State(state): State<AppState>,
    payload: Result<Json<GoogleRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthError> {
    let session = services::google_sign_in(&state, body(payload)?).await?;
    Ok(respond("Google authentication successful", session))
}

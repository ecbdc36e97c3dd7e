use serde::{Deserialize, Serialize};

/// Request body for signup. Fields are optional so a missing one is
/// reported as a bad request instead of a deserialisation failure.
#[derive(Debug, Default, Deserialize)]
pub struct SignupRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Request body for Google sign-in; `token` is the Google ID token.
#[derive(Debug, Default, Deserialize)]
pub struct GoogleRequest {
    pub token: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublicUser {
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Response returned after signup, login or Google sign-in.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: &'static str,
    pub user: PublicUser,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub message: &'static str,
}

/// Trimmed value, or `None` when absent or blank.
pub(crate) fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_are_not_present() {
        assert_eq!(present(&None), None);
        assert_eq!(present(&Some("   ".into())), None);
        assert_eq!(present(&Some(" alice ".into())), Some("alice"));
    }

    #[test]
    fn auth_response_never_contains_password() {
        let body = AuthResponse {
            message: "Login successful",
            user: PublicUser {
                username: "alice".into(),
                email: "a@x.com".into(),
                avatar: None,
            },
            token: "t".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["user"]["username"], "alice");
        assert!(json["user"].get("avatar").is_none());
        assert!(json["user"].get("password").is_none());
    }
}

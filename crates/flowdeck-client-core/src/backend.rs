use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed secret sent with every delegated login. The backend never receives
/// the user's real credential; trust is delegated to the IdP bearer token and
/// this value exists only to satisfy the login contract. Never logged.
pub const DELEGATED_LOGIN_SECRET: &str = "flowdeck-delegated-login";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Access + refresh token pair returned by the login exchange. The access
/// token is the credential for subsequent backend calls; the refresh token is
/// long-lived and persisted by the surrounding application (HTTP cookie).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl CreateUserRequest {
    #[must_use]
    pub fn delegated(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: DELEGATED_LOGIN_SECRET.to_string(),
            email: None,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    #[must_use]
    pub fn delegated(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: DELEGATED_LOGIN_SECRET.to_string(),
        }
    }
}

/// `whoami` resolves the backend user for a bearer token. `Unauthenticated`
/// is the expected first-use signal, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoamiOutcome {
    User(BackendUser),
    Unauthenticated,
}

/// `UsernameUnavailable` is the expected race signal when a concurrent tab
/// won user creation; callers converge via a bounded lookup retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateUserOutcome {
    Created(BackendUser),
    UsernameUnavailable,
}

/// Organization creation is repeatable; `AlreadyExists` is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOrgOutcome {
    Created,
    AlreadyExists,
}

/// `Unauthorized` at login means the IdP token is valid but the backend has
/// no matching session state (for example after a backend storage reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Tokens(TokenPair),
    Unauthorized,
}

/// Transport-level failures. Expected conditions (unauthenticated, conflict,
/// unauthorized) are encoded in the outcome enums above, never here.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend_request_failed:{message}")]
    Request { message: String },
    #[error("backend_read_failed:{message}")]
    Read { message: String },
    #[error("backend_http_{status}:{body}")]
    Http { status: u16, body: String },
    #[error("backend_json_decode_failed:{message}")]
    Decode { message: String },
}

/// Backend RPC surface consumed by the bootstrap coordinator. Pure I/O, no
/// state; the HTTP implementation lives in `flowdeck-backend-client`.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn whoami(&self, bearer_token: &str) -> Result<WhoamiOutcome, BackendError>;

    async fn create_user(
        &self,
        bearer_token: &str,
        request: &CreateUserRequest,
    ) -> Result<CreateUserOutcome, BackendError>;

    async fn ensure_organization(&self, bearer_token: &str)
    -> Result<EnsureOrgOutcome, BackendError>;

    async fn login(
        &self,
        bearer_token: &str,
        request: &LoginRequest,
    ) -> Result<LoginOutcome, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegated_requests_carry_the_placeholder_secret() {
        let create = CreateUserRequest::delegated("casey");
        assert_eq!(create.username, "casey");
        assert_eq!(create.password, DELEGATED_LOGIN_SECRET);
        assert_eq!(create.email, None);

        let login = LoginRequest::delegated("casey");
        assert_eq!(login.password, DELEGATED_LOGIN_SECRET);
    }

    #[test]
    fn backend_error_messages_keep_stable_codes() {
        let error = BackendError::Http {
            status: 502,
            body: "gateway failed".to_string(),
        };
        assert_eq!(error.to_string(), "backend_http_502:gateway failed");

        let error = BackendError::Request {
            message: "connection refused".to_string(),
        };
        assert_eq!(error.to_string(), "backend_request_failed:connection refused");
    }
}

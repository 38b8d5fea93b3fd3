//! HTTP implementation of the flowdeck backend session RPC surface:
//! `whoami`, `create_user`, `ensure_organization`, and the delegated `login`
//! exchange. Expected conditions (unauthenticated, username conflict,
//! already-exists, unauthorized) are mapped to outcome enums; everything
//! else surfaces as a transport error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use uuid::Uuid;

use flowdeck_client_core::backend::{
    BackendError, BackendTransport, BackendUser, CreateUserOutcome, CreateUserRequest,
    EnsureOrgOutcome, LoginOutcome, LoginRequest, TokenPair, WhoamiOutcome,
};

pub const DEFAULT_BACKEND_BASE_URL: &str = "http://127.0.0.1:7860";
pub const ENV_BACKEND_BASE_URL: &str = "FLOWDECK_BACKEND_BASE_URL";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendClientConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("failed to build http client: {message}")]
    HttpClientBuild { message: String },
}

#[derive(Debug, Clone)]
pub struct BackendClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl BackendClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

/// Resolve the backend base url from the environment, falling back to the
/// local default. Returns the url and the source it came from.
pub fn resolve_backend_base_url() -> Result<(String, &'static str), BackendClientConfigError> {
    if let Some(base_url) = env_non_empty(ENV_BACKEND_BASE_URL) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, ENV_BACKEND_BASE_URL));
    }
    normalize_base_url(DEFAULT_BACKEND_BASE_URL).map(|normalized| (normalized, "default_local"))
}

pub fn normalize_base_url(raw: &str) -> Result<String, BackendClientConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(BackendClientConfigError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(BackendClientConfigError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(BackendClientConfigError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(BackendClientConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct BackendHttpClient {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl BackendHttpClient {
    pub fn new(config: BackendClientConfig) -> Result<Self, BackendClientConfigError> {
        let base_url = normalize_base_url(&config.base_url)?;
        // The login exchange sets the long-lived refresh token as a cookie;
        // keep a cookie store so it rides along on subsequent requests.
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|error| BackendClientConfigError::HttpClientBuild {
                message: error.to_string(),
            })?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http,
        })
    }

    /// Client against the environment-resolved base url.
    pub fn from_env() -> Result<Self, BackendClientConfigError> {
        let (base_url, source) = resolve_backend_base_url()?;
        debug!(base_url = %base_url, source, "resolved backend base url");
        Self::new(BackendClientConfig::new(base_url))
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn whoami_path() -> &'static str {
        "/api/v1/users/whoami"
    }

    #[must_use]
    pub fn users_path() -> &'static str {
        "/api/v1/users"
    }

    #[must_use]
    pub fn organization_path() -> &'static str {
        "/api/v1/organizations/ensure"
    }

    #[must_use]
    pub fn login_path() -> &'static str {
        "/api/v1/login"
    }

    async fn send_get(
        &self,
        path: &str,
        bearer_token: &str,
    ) -> Result<(StatusCode, Vec<u8>), BackendError> {
        let url = self.require_endpoint(path)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .http
                .get(url.as_str())
                .bearer_auth(bearer_token)
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) => return read_response(response).await,
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(BackendError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn send_post<Req>(
        &self,
        path: &str,
        bearer_token: &str,
        payload: &Req,
    ) -> Result<(StatusCode, Vec<u8>), BackendError>
    where
        Req: serde::Serialize + ?Sized,
    {
        let url = self.require_endpoint(path)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .http
                .post(url.as_str())
                .bearer_auth(bearer_token)
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout)
                .json(payload);

            match request.send().await {
                Ok(response) => return read_response(response).await,
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(BackendError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn require_endpoint(&self, path: &str) -> Result<String, BackendError> {
        self.endpoint(path).ok_or_else(|| BackendError::Request {
            message: "empty request path".to_string(),
        })
    }
}

async fn read_response(response: reqwest::Response) -> Result<(StatusCode, Vec<u8>), BackendError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| BackendError::Read {
            message: error.to_string(),
        })?;
    Ok((status, bytes.to_vec()))
}

fn decode_body<T>(body: &[u8]) -> Result<T, BackendError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    serde_json::from_slice::<T>(body).map_err(|error| BackendError::Decode {
        message: error.to_string(),
    })
}

fn http_error(status: StatusCode, body: &[u8]) -> BackendError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    BackendError::Http {
        status: status.as_u16(),
        body: if body.is_empty() {
            "<empty>".to_string()
        } else {
            body
        },
    }
}

/// 401/403 mean the backend does not know this token yet; that is the
/// expected first-use signal, not an error.
fn map_whoami(status: StatusCode, body: &[u8]) -> Result<WhoamiOutcome, BackendError> {
    if status.is_success() {
        return decode_body::<BackendUser>(body).map(WhoamiOutcome::User);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Ok(WhoamiOutcome::Unauthenticated);
    }
    Err(http_error(status, body))
}

/// A 409, or a 400 whose body names an unavailable username, is the
/// concurrent-creation race signal.
fn map_create_user(status: StatusCode, body: &[u8]) -> Result<CreateUserOutcome, BackendError> {
    if status.is_success() {
        return decode_body::<BackendUser>(body).map(CreateUserOutcome::Created);
    }
    if status == StatusCode::CONFLICT {
        return Ok(CreateUserOutcome::UsernameUnavailable);
    }
    if status == StatusCode::BAD_REQUEST && body_mentions_unavailable_username(body) {
        return Ok(CreateUserOutcome::UsernameUnavailable);
    }
    Err(http_error(status, body))
}

fn body_mentions_unavailable_username(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    text.contains("unavailable")
}

fn map_ensure_organization(
    status: StatusCode,
    body: &[u8],
) -> Result<EnsureOrgOutcome, BackendError> {
    match status {
        StatusCode::CREATED => Ok(EnsureOrgOutcome::Created),
        StatusCode::OK | StatusCode::CONFLICT => Ok(EnsureOrgOutcome::AlreadyExists),
        _ => Err(http_error(status, body)),
    }
}

fn map_login(status: StatusCode, body: &[u8]) -> Result<LoginOutcome, BackendError> {
    if status.is_success() {
        return decode_body::<TokenPair>(body).map(LoginOutcome::Tokens);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Ok(LoginOutcome::Unauthorized);
    }
    Err(http_error(status, body))
}

#[async_trait]
impl BackendTransport for BackendHttpClient {
    async fn whoami(&self, bearer_token: &str) -> Result<WhoamiOutcome, BackendError> {
        let (status, body) = self.send_get(Self::whoami_path(), bearer_token).await?;
        map_whoami(status, &body)
    }

    async fn create_user(
        &self,
        bearer_token: &str,
        request: &CreateUserRequest,
    ) -> Result<CreateUserOutcome, BackendError> {
        let (status, body) = self
            .send_post(Self::users_path(), bearer_token, request)
            .await?;
        map_create_user(status, &body)
    }

    async fn ensure_organization(
        &self,
        bearer_token: &str,
    ) -> Result<EnsureOrgOutcome, BackendError> {
        let (status, body) = self
            .send_post(Self::organization_path(), bearer_token, &serde_json::json!({}))
            .await?;
        map_ensure_organization(status, &body)
    }

    async fn login(
        &self,
        bearer_token: &str,
        request: &LoginRequest,
    ) -> Result<LoginOutcome, BackendError> {
        let (status, body) = self
            .send_post(Self::login_path(), bearer_token, request)
            .await?;
        map_login(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env<T>(value: Option<&str>, test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = std::env::var(ENV_BACKEND_BASE_URL).ok();
        if let Some(value) = value {
            unsafe { std::env::set_var(ENV_BACKEND_BASE_URL, value) };
        } else {
            unsafe { std::env::remove_var(ENV_BACKEND_BASE_URL) };
        }

        let result = test();

        if let Some(value) = previous {
            unsafe { std::env::set_var(ENV_BACKEND_BASE_URL, value) };
        } else {
            unsafe { std::env::remove_var(ENV_BACKEND_BASE_URL) };
        }

        result
    }

    #[test]
    fn normalize_base_url_trims_and_drops_trailing_slash() {
        let normalized = normalize_base_url(" https://flowdeck.example.com/ ").expect("valid url");
        assert_eq!(normalized, "https://flowdeck.example.com");
    }

    #[test]
    fn normalize_base_url_requires_http_scheme_and_host() {
        assert_eq!(
            normalize_base_url("flowdeck.example.com"),
            Err(BackendClientConfigError::InvalidBaseUrl)
        );
        assert_eq!(
            normalize_base_url("https:///flows"),
            Err(BackendClientConfigError::InvalidBaseUrl)
        );
        assert_eq!(
            normalize_base_url("  "),
            Err(BackendClientConfigError::EmptyBaseUrl)
        );
    }

    #[test]
    fn resolve_backend_base_url_defaults_local() {
        with_env(None, || {
            let (resolved, source) = resolve_backend_base_url().expect("default url");
            assert_eq!(resolved, DEFAULT_BACKEND_BASE_URL);
            assert_eq!(source, "default_local");
        });
    }

    #[test]
    fn resolve_backend_base_url_prefers_env() {
        with_env(Some("https://staging.flowdeck.example.com/"), || {
            let (resolved, source) = resolve_backend_base_url().expect("env url");
            assert_eq!(resolved, "https://staging.flowdeck.example.com");
            assert_eq!(source, ENV_BACKEND_BASE_URL);
        });
    }

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = BackendHttpClient::new(BackendClientConfig::new(
            "https://flowdeck.example.com/",
        ))
        .expect("backend client");

        assert_eq!(
            client.endpoint("/api/v1/login"),
            Some("https://flowdeck.example.com/api/v1/login".to_string())
        );
        assert_eq!(
            client.endpoint("api/v1/login"),
            Some("https://flowdeck.example.com/api/v1/login".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    #[test]
    fn whoami_mapping_treats_auth_failures_as_unauthenticated() {
        let outcome = map_whoami(StatusCode::UNAUTHORIZED, b"{}").expect("mapped");
        assert_eq!(outcome, WhoamiOutcome::Unauthenticated);

        let body = br#"{"id":"u_1","username":"casey","is_active":true}"#;
        let outcome = map_whoami(StatusCode::OK, body).expect("mapped");
        match outcome {
            WhoamiOutcome::User(user) => assert_eq!(user.username, "casey"),
            WhoamiOutcome::Unauthenticated => unreachable!("expected a user"),
        }

        let error = map_whoami(StatusCode::BAD_GATEWAY, b"oops").expect_err("http error");
        assert_eq!(error.to_string(), "backend_http_502:oops");
    }

    #[test]
    fn create_user_mapping_recognizes_the_race_signal() {
        let outcome = map_create_user(StatusCode::CONFLICT, b"{}").expect("mapped");
        assert_eq!(outcome, CreateUserOutcome::UsernameUnavailable);

        let body = br#"{"detail":"This username is unavailable."}"#;
        let outcome = map_create_user(StatusCode::BAD_REQUEST, body).expect("mapped");
        assert_eq!(outcome, CreateUserOutcome::UsernameUnavailable);

        let body = br#"{"detail":"password too short"}"#;
        let error = map_create_user(StatusCode::BAD_REQUEST, body).expect_err("fatal");
        assert!(error.to_string().starts_with("backend_http_400:"));
    }

    #[test]
    fn ensure_organization_mapping_accepts_already_exists() {
        assert_eq!(
            map_ensure_organization(StatusCode::CREATED, b"{}").expect("mapped"),
            EnsureOrgOutcome::Created
        );
        assert_eq!(
            map_ensure_organization(StatusCode::OK, b"{}").expect("mapped"),
            EnsureOrgOutcome::AlreadyExists
        );
        assert_eq!(
            map_ensure_organization(StatusCode::CONFLICT, b"{}").expect("mapped"),
            EnsureOrgOutcome::AlreadyExists
        );
        assert!(map_ensure_organization(StatusCode::INTERNAL_SERVER_ERROR, b"boom").is_err());
    }

    #[test]
    fn login_mapping_distinguishes_unauthorized_from_fatal() {
        let body = br#"{"access_token":"acc","refresh_token":"ref"}"#;
        let outcome = map_login(StatusCode::OK, body).expect("mapped");
        assert_eq!(
            outcome,
            LoginOutcome::Tokens(TokenPair {
                access_token: "acc".to_string(),
                refresh_token: "ref".to_string(),
            })
        );

        assert_eq!(
            map_login(StatusCode::UNAUTHORIZED, b"{}").expect("mapped"),
            LoginOutcome::Unauthorized
        );
        assert!(map_login(StatusCode::SERVICE_UNAVAILABLE, b"down").is_err());
    }

    #[test]
    fn path_helpers_are_deterministic() {
        assert_eq!(BackendHttpClient::whoami_path(), "/api/v1/users/whoami");
        assert_eq!(BackendHttpClient::users_path(), "/api/v1/users");
        assert_eq!(
            BackendHttpClient::organization_path(),
            "/api/v1/organizations/ensure"
        );
        assert_eq!(BackendHttpClient::login_path(), "/api/v1/login");
    }
}

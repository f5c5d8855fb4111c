//! API key authentication for the operator endpoints.
//!
//! When no keys are configured every request is let through. Otherwise the
//! `X-API-Key` header must carry one of the configured keys.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Authentication configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Valid API keys. Empty disables authentication.
    pub api_keys: HashSet<String>,
}

impl AuthConfig {
    /// Creates a config accepting `keys`.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            api_keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
}

impl AuthState {
    /// Creates a new authentication state.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Validates an API key.
    #[must_use]
    pub fn validate_api_key(&self, key: &str) -> bool {
        self.config.api_keys.contains(key)
    }

    /// Checks if authentication is required.
    #[must_use]
    pub fn require_auth(&self) -> bool {
        !self.config.api_keys.is_empty()
    }
}

/// Authentication errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Missing authentication header.
    #[error("Missing authentication")]
    MissingAuth,
    /// Invalid API key.
    #[error("Invalid API key")]
    InvalidApiKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::UNAUTHORIZED;
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Extracts the API key from request headers.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Authentication middleware.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !auth.require_auth() {
        return Ok(next.run(request).await);
    }

    match extract_api_key(&headers) {
        Some(key) if auth.validate_api_key(key) => {
            debug!("API key accepted");
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected invalid API key");
            Err(AuthError::InvalidApiKey)
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request without API key");
            Err(AuthError::MissingAuth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_auth_disabled_without_keys() {
        let state = AuthState::new(AuthConfig::default());
        assert!(!state.require_auth());
    }

    #[test]
    fn test_validate_api_key() {
        let state = AuthState::new(AuthConfig::with_keys(["secret"]));
        assert!(state.require_auth());
        assert!(state.validate_api_key("secret"));
        assert!(!state.validate_api_key("other"));
    }

    #[test]
    fn test_extract_api_key() {
        let mut headers = HeaderMap::new();
        assert!(extract_api_key(&headers).is_none());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert_eq!(extract_api_key(&headers), Some("secret"));
    }
}

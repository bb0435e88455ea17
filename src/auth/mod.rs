//! OAuth 2.1 protected-resource support for the HTTP transport.
//!
//! Serves RFC 9728 protected-resource metadata and enforces bearer tokens on
//! the MCP endpoint. Token validation is delegated to a pluggable
//! [`AuthorizationProvider`]; the core only checks that the required scopes
//! are granted.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

/// Authorization configuration for one HTTP endpoint.
#[derive(Debug, Clone)]
pub struct AuthorizationConfig {
    /// Where the protected-resource metadata is served.
    pub metadata_path: String,
    /// Authorization servers advertised in the metadata.
    pub authorization_servers: Vec<String>,
    /// Scopes a token must carry to reach the endpoint.
    pub required_scopes: Vec<String>,
    /// `Cache-Control: max-age` for the metadata document, in seconds.
    pub cache_ttl: u64,
    /// Admit requests when the provider itself errors (outage tolerance,
    /// development only). Rejected tokens are still rejected.
    pub fail_open: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            metadata_path: "/.well-known/oauth-protected-resource".to_string(),
            authorization_servers: Vec::new(),
            required_scopes: Vec::new(),
            cache_ttl: 300,
            fail_open: false,
        }
    }
}

/// Context returned by providers after successful validation.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: Option<String>,
    pub scopes: Vec<String>,
    pub claims: Value,
}

/// Why validation did not produce a context.
#[derive(Debug)]
pub enum AuthError {
    /// The token is bad. Always a 401.
    InvalidToken(String),
    /// The provider could not decide (network, JWKS outage). Admitted only
    /// under `fail_open`.
    Unavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken(reason) => write!(f, "invalid token: {reason}"),
            Self::Unavailable(reason) => write!(f, "authorization unavailable: {reason}"),
        }
    }
}

/// Pluggable token validator. Implementations are expected to cache JWKS
/// and fail fast on known-bad issuers; the core does neither.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Serves metadata and decides admission for each request.
pub struct AuthorizationManager {
    config: AuthorizationConfig,
    provider: Arc<dyn AuthorizationProvider>,
}

/// Outcome of [`AuthorizationManager::authorize`].
pub enum AuthDecision {
    /// Let the request through with this context (`None` under fail-open).
    Allow(Option<AuthContext>),
    /// Reject with this response.
    Deny(Response),
}

impl AuthorizationManager {
    pub fn new(config: AuthorizationConfig, provider: Arc<dyn AuthorizationProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &AuthorizationConfig {
        &self.config
    }

    pub fn metadata_path(&self) -> &str {
        &self.config.metadata_path
    }

    /// RFC 9728 protected-resource metadata document.
    pub fn metadata_document(&self, resource: &str) -> Value {
        json!({
            "resource": resource,
            "authorization_servers": self.config.authorization_servers,
            "scopes_supported": self.config.required_scopes,
            "bearer_methods_supported": ["header"],
        })
    }

    /// Response for a `GET` on the metadata path.
    pub fn metadata_response(&self, resource: &str) -> Response {
        let mut headers = HeaderMap::new();
        let cache = format!("public, max-age={}", self.config.cache_ttl);
        if let Ok(value) = HeaderValue::from_str(&cache) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        (StatusCode::OK, headers, Json(self.metadata_document(resource))).into_response()
    }

    /// Decide whether a request with this `Authorization` header may reach
    /// the endpoint. `resource_metadata_url` goes into the 401 challenge.
    pub async fn authorize(
        &self,
        authorization: Option<&str>,
        resource_metadata_url: &str,
    ) -> AuthDecision {
        let token = authorization.and_then(extract_bearer);
        let Some(token) = token else {
            return AuthDecision::Deny(
                self.challenge(resource_metadata_url, "missing bearer token"),
            );
        };

        match self.provider.validate(token).await {
            Ok(context) => {
                let granted = &context.scopes;
                let missing: Vec<&String> = self
                    .config
                    .required_scopes
                    .iter()
                    .filter(|scope| !granted.contains(scope))
                    .collect();
                if !missing.is_empty() {
                    return AuthDecision::Deny(insufficient_scope(resource_metadata_url));
                }
                AuthDecision::Allow(Some(context))
            }
            Err(AuthError::Unavailable(reason)) if self.config.fail_open => {
                warn!(reason = %reason, "authorization fail-open engaged; admitting request");
                AuthDecision::Allow(None)
            }
            Err(e) => {
                warn!(error = %e, "authorization rejected request");
                AuthDecision::Deny(self.challenge(resource_metadata_url, &e.to_string()))
            }
        }
    }

    fn challenge(&self, resource_metadata_url: &str, reason: &str) -> Response {
        let challenge =
            format!("Bearer resource_metadata=\"{resource_metadata_url}\", error=\"invalid_token\"");
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        (
            StatusCode::UNAUTHORIZED,
            headers,
            Json(json!({ "error": "unauthorized", "detail": reason })),
        )
            .into_response()
    }
}

fn insufficient_scope(resource_metadata_url: &str) -> Response {
    let challenge = format!(
        "Bearer resource_metadata=\"{resource_metadata_url}\", error=\"insufficient_scope\""
    );
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        headers.insert(header::WWW_AUTHENTICATE, value);
    }
    (
        StatusCode::FORBIDDEN,
        headers,
        Json(json!({ "error": "insufficient_scope" })),
    )
        .into_response()
}

fn extract_bearer(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

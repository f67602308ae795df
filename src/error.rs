//! Error handling for the Smartly Bridge.
//!
//! The wire-level error vocabulary is closed: every failure a client can
//! observe maps to one of the stable `{"error": <kind>}` strings below.
//! Internal detail (upstream bodies, IO errors) is logged, never returned.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Reason an authentication check rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    IpNotAllowed,
    MissingHeaders,
    InvalidClientId,
    InvalidTimestamp,
    NonceReused,
    InvalidSignature,
    InvalidOrExpiredToken,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::IpNotAllowed => "ip_not_allowed",
            DenyReason::MissingHeaders => "missing_headers",
            DenyReason::InvalidClientId => "invalid_client_id",
            DenyReason::InvalidTimestamp => "invalid_timestamp",
            DenyReason::NonceReused => "nonce_reused",
            DenyReason::InvalidSignature => "invalid_signature",
            DenyReason::InvalidOrExpiredToken => "invalid_or_expired_token",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request failed authentication (401)
    #[error("authentication denied: {0}")]
    AuthDenied(DenyReason),

    /// Client exceeded the sliding-window rate limit (429)
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64, limit: u32 },

    /// Malformed request (400); payload is the wire error kind
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Authorization denied (403)
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Target does not exist (404)
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// An upstream collaborator failed (500); detail is logged only
    #[error("upstream failure ({kind}): {detail}")]
    Upstream { kind: &'static str, detail: String },

    /// Required component is missing or not initialized (500)
    #[error("not available: {0}")]
    Infra(&'static str),

    /// Bridge is shutting down or overloaded (503)
    #[error("service unavailable")]
    Unavailable,

    /// HTTP client error (500)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error (500)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (500)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (500)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for upstream failures carrying internal detail.
    pub fn upstream(kind: &'static str, detail: impl Into<String>) -> Self {
        Error::Upstream {
            kind,
            detail: detail.into(),
        }
    }

    /// The stable wire string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthDenied(reason) => reason.as_str(),
            Error::RateLimited { .. } => "rate_limited",
            Error::InvalidRequest(kind)
            | Error::Forbidden(kind)
            | Error::NotFound(kind)
            | Error::Upstream { kind, .. }
            | Error::Infra(kind) => *kind,
            Error::Unavailable => "service_unavailable",
            Error::Http(_) | Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => {
                "internal_server_error"
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::AuthDenied(_) => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Upstream { kind, detail } => {
                tracing::error!(kind = *kind, detail = %detail, "upstream failure");
            }
            Error::Http(err) => tracing::error!(error = %err, "http client failure"),
            Error::Serialization(err) => tracing::error!(error = %err, "serialization failure"),
            Error::Io(err) => tracing::error!(error = %err, "io failure"),
            Error::Internal(msg) => tracing::error!(error = %msg, "internal failure"),
            _ => {}
        }

        let status = self.status();
        let body = Json(json!({ "error": self.kind() }));

        if let Error::RateLimited { retry_after, limit } = &self {
            let headers = [
                (header::RETRY_AFTER, retry_after.to_string()),
                (
                    header::HeaderName::from_static("x-ratelimit-limit"),
                    limit.to_string(),
                ),
                (
                    header::HeaderName::from_static("x-ratelimit-remaining"),
                    "0".to_string(),
                ),
            ];
            return (status, headers, body).into_response();
        }

        (status, body).into_response()
    }
}

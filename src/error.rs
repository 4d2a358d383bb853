//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the preview core.
///
/// Variants map to the error kinds in the design ("Configuration",
/// "Security-denial", "Transport", "Resource-exhaustion", "Shutdown");
/// build failures are intentionally NOT represented here -- they are
/// captured as structured `BuildError` values attached to a
/// `BuildResult` and never promoted to a process-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Origin rejected, rate limit exceeded, or auth denied.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request body or unsupported method on a known route.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Rate limit exceeded; carries the seconds until retry.
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// HTTP method not allowed on this path.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// I/O error (watcher, listener bind, cache).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error (read/write/deadline); subscriber is cleaned
    /// up, other subscribers are unaffected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal error not classified elsewhere.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_response, extra_headers): (StatusCode, ErrorResponse, Vec<(&str, String)>) = match self {
            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", e.to_string()),
                vec![],
            ),
            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
                vec![],
            ),
            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
                vec![],
            ),
            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
                vec![],
            ),
            Error::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
                vec![],
            ),
            Error::RateLimitExceeded { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_code(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_EXCEEDED",
                    "Too many requests",
                ),
                vec![("retry-after", retry_after_secs.to_string())],
            ),
            Error::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorResponse::with_code(StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED", "Method not allowed"),
                vec![],
            ),
            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", "I/O operation failed"),
                    vec![],
                )
            }
            Error::Transport(msg) => {
                tracing::warn!("Transport error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR", msg),
                    vec![],
                )
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error"),
                    vec![],
                )
            }
        };

        let mut response = (status, Json(error_response)).into_response();
        for (name, value) in extra_headers {
            if let Ok(hv) = axum::http::HeaderValue::from_str(&value) {
                response.headers_mut().insert(
                    axum::http::HeaderName::from_bytes(name.as_bytes()).expect("valid header name"),
                    hv,
                );
            }
        }
        response
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<axum::http::Error> for Error {
    fn from(err: axum::http::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new(StatusCode::NOT_FOUND, "subscriber not found");
        assert_eq!(err.status, 404);
        assert!(err.code.is_none());
    }

    #[test]
    fn test_error_response_with_code() {
        let err = ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_BODY", "invalid JSON");
        assert_eq!(err.status, 400);
        assert_eq!(err.code, Some("BAD_BODY".to_string()));
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let resp = Error::RateLimitExceeded { retry_after_secs: 7 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "7");
    }

    #[test]
    fn test_method_not_allowed_status() {
        let resp = Error::MethodNotAllowed.into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

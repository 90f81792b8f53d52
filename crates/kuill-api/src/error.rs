//! Error types for the gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, invalid, expired or tampered session
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Malformed request or watch correlation tokens
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request body has the wrong media type
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Backend denied the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested kind or route is unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend could not be reached or returned an unusable response
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Missing or invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Two authenticators registered under the same type and name
    #[error("duplicate authenticator: {0}")]
    DuplicateAuthenticator(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::DuplicateAuthenticator(_) => StatusCode::CONFLICT,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Error::Unauthorized(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::BackendUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<kuill_common::Error> for Error {
    fn from(e: kuill_common::Error) -> Self {
        match e {
            kuill_common::Error::Config(msg) => Error::Config(msg),
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

//! Error types for the proxy.

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::dispatch::BackendResponse;
use crate::response;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while proxying a request.
///
/// `Clone` so that a single refresh failure can be handed to every caller
/// queued behind it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Inbound body could not be decoded for its declared content type.
    #[error("Malformed request body: {0}")]
    MalformedInput(String),

    /// Inbound body exceeds the configured limit, in bytes.
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// No access/refresh pair is available, so no refresh can be attempted.
    #[error("Authentication required")]
    MissingCredentials,

    /// The refresh endpoint answered with a non-success status.
    #[error("Token refresh rejected by backend ({})", .0.status)]
    RefreshRejected(BackendResponse),

    /// The refresh endpoint answered 2xx with an unusable body.
    #[error("Invalid refresh response: {0}")]
    InvalidRefreshResponse(String),

    /// The refresh call exceeded the configured request timeout.
    #[error("Token refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    /// No response object was obtained from the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// A rewrite rule produced a target that is not a valid URL.
    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Network(e.to_string())
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(e: url::ParseError) -> Self {
        ProxyError::InvalidTarget(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ProxyError::RefreshRejected(backend) => return response::into_response(backend),
            ProxyError::Network(msg) => return response::network_failure(&msg),
            ProxyError::MalformedInput(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg)
            }
            e @ ProxyError::PayloadTooLarge(_) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", e.to_string())
            }
            ProxyError::MissingCredentials => (
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "No access or refresh token found".to_string(),
            ),
            ProxyError::InvalidRefreshResponse(msg) => {
                (StatusCode::BAD_GATEWAY, "refresh_error", msg)
            }
            e @ ProxyError::RefreshTimeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", e.to_string())
            }
            ProxyError::InvalidTarget(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "invalid_target", msg)
            }
            ProxyError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error_type, error = %message, "Proxy error");
        } else {
            tracing::warn!(status = %status, error_type, error = %message, "Proxy client error");
        }

        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message
            }
        });

        (status, Json(body)).into_response()
    }
}

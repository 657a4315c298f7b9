use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::models::FallbackResponse;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Upstream Errors
///
/// Transport failures towards an upstream are answered with the gateway's
/// fallback body instead of a generic error body, so clients see the same
/// payload whether the failure was detected here or at `/fallback`:
///
/// - `UpstreamUnavailable` - connection refused, DNS failure, reset (503)
/// - `UpstreamTimeout` - upstream did not answer within `UPSTREAM_TIMEOUT_MS` (504)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for non-upstream failures.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::UpstreamUnavailable(_) => {
                return fallback_response(StatusCode::SERVICE_UNAVAILABLE);
            }
            AppError::UpstreamTimeout(_) => {
                return fallback_response(StatusCode::GATEWAY_TIMEOUT);
            }
            AppError::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request body exceeds the configured limit.",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Gateway configuration error. Please contact support.",
            ),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Build the fallback response returned when an upstream cannot serve a request.
pub fn fallback_response(status: StatusCode) -> Response {
    (status, axum::Json(FallbackResponse::new(status))).into_response()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

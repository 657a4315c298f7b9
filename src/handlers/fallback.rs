//! Local fallback endpoint.
//!
//! Serves the same body the gateway returns when an upstream cannot be
//! reached, so clients and tests can inspect it directly.

use axum::http::StatusCode;
use axum::response::Response;

use crate::error::fallback_response;

/// `GET /fallback`: 503 with the fallback body.
pub async fn fallback() -> Response {
    fallback_response(StatusCode::SERVICE_UNAVAILABLE)
}

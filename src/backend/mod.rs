//! Sample backend used as the gateway's upstream in demos and tests.
//!
//! # Endpoints
//!
//! - `GET /test/normal` - Healthy response
//! - `GET /test/slow?delay=100` - Healthy response after `delay` ms
//! - `GET /test/error` - Always `500`
//! - `GET /test/random` - `500` about half of the time
//! - `GET /test/timeout?delay=5000` - Response after `delay` ms, meant to
//!   outlast the gateway's upstream timeout
//! - `GET /test/headers` - Echo of the received request headers
//!
//! A second family under `/breaker` exercises failure handling in front of a
//! flaky service:
//!
//! - `GET /breaker/slow?delay=3000` - Healthy response after `delay` ms
//! - `GET /breaker/error` - Always `500`
//! - `GET /breaker/random` - `500` about half of the time
//! - `GET /breaker/timeout` - Never responds
//!
//! Every request is numbered by a per-process counter, starting at 1. The
//! `/breaker` endpoints keep a counter of their own.

mod handlers;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::config::BackendConfig;

/// Default `delay` of `/test/slow`, in milliseconds.
pub const DEFAULT_SLOW_DELAY_MS: u64 = 100;

/// Default `delay` of `/test/timeout`, in milliseconds.
pub const DEFAULT_TIMEOUT_DELAY_MS: u64 = 5_000;

/// Default `delay` of `/breaker/slow`, in milliseconds.
pub const DEFAULT_BREAKER_SLOW_DELAY_MS: u64 = 3_000;

/// Shared state of the sample backend.
#[derive(Clone, Debug)]
pub struct BackendState {
    requests: Arc<AtomicU64>,
    breaker_requests: Arc<AtomicU64>,
    max_delay: Duration,
}

impl BackendState {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            breaker_requests: Arc::new(AtomicU64::new(0)),
            max_delay: config.max_delay,
        }
    }

    /// Number the next request.
    pub fn next_request_id(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number the next `/breaker` request.
    pub fn next_breaker_request_id(&self) -> u64 {
        self.breaker_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Requested delay, bounded by `BACKEND_MAX_DELAY_MS`.
    pub fn clamp_delay(&self, requested_ms: u64) -> Duration {
        Duration::from_millis(requested_ms).min(self.max_delay)
    }
}

/// Build the sample backend router.
pub fn build_backend_router(state: BackendState) -> Router {
    Router::new()
        .route("/test/normal", get(handlers::normal))
        .route("/test/slow", get(handlers::slow))
        .route("/test/error", get(handlers::error))
        .route("/test/random", get(handlers::random))
        .route("/test/timeout", get(handlers::timeout))
        .route("/test/headers", get(handlers::headers))
        .route("/breaker/slow", get(handlers::breaker_slow))
        .route("/breaker/error", get(handlers::breaker_error))
        .route("/breaker/random", get(handlers::breaker_random))
        .route("/breaker/timeout", get(handlers::breaker_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

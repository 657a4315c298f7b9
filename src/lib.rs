//! # Gateway Sample
//!
//! A small API gateway built from Axum routes and Tower filters, together with
//! a canned backend to point it at:
//!
//! - **Throttle**: per-route token bucket answering `429` when empty
//! - **Keyed rate limiting**: per client IP, path, or IP and API segment
//! - **Timing**: one log line with the duration of every timed request
//! - **Proxying**: prefix stripping, header filters, fallback on upstream failure
//! - **Observability**: request IDs, structured logging, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Global filters (Request ID → Trace → X-Gateway)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Route filters (Throttle | Rate Limit | Timing)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Proxy (path rewrite, reqwest client, fallback)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Upstream (sample_server or any HTTP service)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway_sample::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let app = build_router(AppState::new(config)?)?;
//!
//!     // Start the server...
//!     # let _ = app;
//!     Ok(())
//! }
//! ```
//!
//! Run the gateway in front of the sample backend:
//! ```bash
//! cargo run --bin sample_server &
//! THROTTLE_CAPACITY=3 cargo run
//! curl -i http://localhost:8080/api/test/normal
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use backend::{BackendState, build_backend_router};
pub use config::{BackendConfig, Config};
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;

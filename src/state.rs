//! Shared gateway state for Axum handlers.
//!
//! Cloned into every handler. Holds the configuration and the pooled HTTP
//! client used for all upstream calls, so connections are reused across
//! requests and routes.
//!
//! # Background Tasks
//!
//! Periodic maintenance (pruning idle rate limit keys) runs on a
//! `tokio_util::task::TaskTracker` and stops when the `CancellationToken`
//! fires. Call [`AppState::shutdown`] after the server has stopped.

use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::filter::RequestRateLimitLayer;

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration
    pub config: Arc<Config>,
    /// Upstream HTTP client, bounded by `UPSTREAM_TIMEOUT_MS`
    pub http: Client,
    /// Start of the gateway process, for `/actuator/health`
    started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Signals background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state and its upstream client.
    ///
    /// Redirects are passed back to the client rather than followed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialize).
    pub fn new(config: Config) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build upstream client: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            http,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Spawn the task that prunes idle keys of `layer`.
    ///
    /// Does nothing when `RATE_LIMIT_PRUNE_INTERVAL_SECS` is 0. Must be called
    /// from within a Tokio runtime.
    pub fn spawn_rate_limit_pruning(&self, layer: &RequestRateLimitLayer) {
        let every = self.config.rate_limit_prune_interval;
        if every.is_zero() {
            debug!("Rate limit key pruning disabled");
            return;
        }

        let cancel = self.cancellation_token.clone();
        self.task_tracker.spawn(layer.clone().run_pruning(every, cancel));
        debug!(interval = ?every, "Rate limit key pruning started");
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Stopping background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Whole seconds since the state was created.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

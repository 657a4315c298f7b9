//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed by a dedicated HTTP listener on `METRICS_PORT`
//! (default 9090, `0` disables it).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_throttled_total` - Requests rejected by a route throttle (label: route)
//! - `gateway_requests_rate_limited_total` - Requests rejected by the keyed limiter (label: resolver)
//! - `gateway_upstream_failures_total` - Upstream transport failures (label: kind)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - Duration measured by the timing filter (labels: method, status)
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_THROTTLED_TOTAL: &str = "gateway_requests_throttled_total";
    pub const REQUESTS_RATE_LIMITED_TOTAL: &str = "gateway_requests_rate_limited_total";
    pub const UPSTREAM_FAILURES_TOTAL: &str = "gateway_upstream_failures_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed, e.g. because the
/// listener address is in use or a recorder is already installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_THROTTLED_TOTAL,
        "Total number of requests rejected by a route throttle"
    );
    describe_counter!(
        names::REQUESTS_RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the keyed rate limiter"
    );
    describe_counter!(
        names::UPSTREAM_FAILURES_TOTAL,
        "Total number of upstream connect or timeout failures"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time spent in a timed filter chain, in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a request rejected by the throttle of `route`.
pub fn record_throttled(route: &str) {
    counter!(names::REQUESTS_THROTTLED_TOTAL, "route" => route.to_string()).increment(1);
}

/// Record a request rejected by the keyed limiter.
pub fn record_rate_limited(resolver: &str) {
    counter!(names::REQUESTS_RATE_LIMITED_TOTAL, "resolver" => resolver.to_string()).increment(1);
}

/// Record an upstream failure (`connect`, `timeout`, `body`).
pub fn record_upstream_failure(kind: &str) {
    counter!(names::UPSTREAM_FAILURES_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record the duration of a timed request.
pub fn record_request_duration(method: &str, status: &str, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use gateway_sample::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    utils::init_tracing();

    info!("Starting Gateway Sample v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the gateway, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        upstream = %config.upstream_url,
        timing_upstream = %config.timing_upstream_url,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Prometheus metrics disabled (METRICS_PORT=0)");
    }

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;

    let state = AppState::new(config).map_err(|e| {
        error!("Failed to initialize gateway: {e}");
        exitcode::SOFTWARE
    })?;
    let background = state.clone();
    let app = build_router(state).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");
    info!("Routes:");
    info!("  ANY  /api/**            - Throttled, proxied to UPSTREAM_URL");
    info!("  ANY  /gateway/rate/**   - Keyed rate limit, proxied to UPSTREAM_URL");
    info!("  ANY  /timing/**         - Timed, proxied to TIMING_UPSTREAM_URL");
    info!("  GET  /anything/png      - Host **.abc.org, proxied to HTTPBIN_URL");
    info!("  GET  /image/webp        - Proxied to HTTPBIN_URL");
    info!("  GET  /get               - Host **.throttle.org, throttled, proxied to HTTPBIN_URL");
    info!("  ANY  /fallback          - Fallback response");
    info!("  GET  /actuator          - Management index");

    // Peer addresses feed client IP resolution for rate limiting
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    background.shutdown().await;
    info!("Gateway shutdown complete");
    Ok(())
}

use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use gateway_sample::{BackendConfig, BackendState, build_backend_router, utils};

#[tokio::main]
async fn main() -> ExitCode {
    utils::init_tracing();

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

async fn run() -> Result<(), exitcode::ExitCode> {
    let config = BackendConfig::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!(
        max_delay_ms = config.max_delay.as_millis() as u64,
        "Sample backend listening on http://{addr}"
    );

    let app = build_backend_router(BackendState::new(&config));
    axum::serve(listener, app)
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    info!("Sample backend stopped");
    Ok(())
}

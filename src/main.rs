use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scribe_web::metrics::try_init_metrics;
use scribe_web::{AppState, Config, build_router, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging comes up first so configuration errors are reported through it
    let (log_json, log_level) = match &config {
        Ok(config) => (config.log_json, config.log_level.as_str()),
        Err(_) => (false, "info"),
    };
    if let Err(e) = init_tracing(log_json, log_level) {
        eprintln!("{e:#}");
        return ExitCode::from(exitcode::SOFTWARE as u8);
    }

    info!("Starting Scribe Web v{}", env!("CARGO_PKG_VERSION"));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => {
            error!("Configuration error: {e}");
            Err(exitcode::CONFIG)
        }
    };

    match result {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Install the global tracing subscriber, as text or JSON lines.
fn init_tracing(json: bool, default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        rate_limit = config.rate_limit_max_requests,
        route_rate_limit = config.route_rate_limit_max_requests,
        cors_origins = ?config.cors_allowed_origins,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        try_init_metrics(metrics_addr);
    } else {
        info!("Prometheus exporter disabled (METRICS_PORT=0)");
    }

    // Build application state and router
    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health     - Health check");
    info!("  GET  /csrf-token - Issue a CSRF token");
    info!("  GET  /metrics    - Request metrics snapshot");
    info!("  POST /echo       - Echo a form field (CSRF protected)");

    // Peer addresses feed the client key when no forwarding header is present
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

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

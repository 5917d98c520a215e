use clap::Parser;
use std::sync::Arc;

use incident_metrics::config::Config;
use incident_metrics::metrics::{track_operation, HostProbe, MetricsRegistry};
use incident_metrics::{logging, server, AppState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::parse();
    logging::init_logging(&config.log_level);

    // ── 1. Build the process-wide registry ───────────────────────
    let registry = {
        let _timer = track_operation("metrics registry initialisation");
        let probe = HostProbe::new(config.accelerator_probe());
        Arc::new(MetricsRegistry::new(config.metrics(), Box::new(probe)))
    };
    let metrics = config.metrics();
    tracing::info!(
        window_size = metrics.window_size,
        system_refresh_secs = metrics.system_refresh.as_secs(),
        max_keys = metrics.max_keys,
        accelerator = ?config.accelerator,
        accelerator_timeout_ms = config.accelerator_timeout_ms,
        "metrics registry ready"
    );

    // ── 2. Build shared state ────────────────────────────────────
    let state = Arc::new(AppState {
        metrics: registry,
        stream_interval: config.stream_interval(),
    });

    // ── 3. Build Axum router ─────────────────────────────────────
    let app = server::create_router(state);

    // ── 4. Bind & serve ──────────────────────────────────────────
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(%addr, error = %e, "failed to bind");
        e
    })?;

    tracing::info!("listening on http://{addr}");
    tracing::info!("metrics JSON → http://{addr}/api/v1/metrics");
    tracing::info!("metrics SSE  → http://{addr}/api/v1/metrics/stream");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

//! Axum API server binary.

use std::net::SocketAddr;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metrics_exporter_prometheus::PrometheusHandle;
use render_api::{create_router, metrics, ApiConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;
    init_tracing()?;

    let config = ApiConfig::from_env();
    info!(host = %config.host, port = config.port, env = %config.environment, "Starting render-api");

    let state = AppState::from_env(config.clone())
        .await
        .context("connecting to the backing store")?;
    let app = create_router(state, prometheus_handle());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "Accepting requests");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("render-api stopped");
    Ok(())
}

/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("render=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
    Ok(())
}

/// Prometheus recorder unless `METRICS_ENABLED` is false or 0.
fn prometheus_handle() -> Option<PrometheusHandle> {
    let enabled = std::env::var("METRICS_ENABLED").map_or(true, |v| v == "true" || v == "1");
    if !enabled {
        return None;
    }
    metrics::init_metrics()
        .inspect_err(|e| warn!(error = %e, "Prometheus recorder unavailable"))
        .ok()
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested, draining connections"),
        Err(e) => {
            warn!(error = %e, "Ctrl-C handler unavailable; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

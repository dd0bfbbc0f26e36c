//! Lodestar Context Service
//!
//! HTTP entry point for the context engine:
//! - Answering questions with cited evidence
//! - Indexing and removing documents
//! - Health, readiness and Prometheus metrics

use anyhow::Context;
use axum::{routing::get, Router};
use lodestar_common::{config::ObservabilityConfig, metrics, AppConfig, VERSION};
use lodestar_context::{
    http::{create_router, AppState},
    EngineComponents, QueryEngine,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.observability);

    info!(
        version = VERSION,
        service = %config.observability.service_name,
        "Starting Lodestar context service"
    );

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            metrics::register_metrics();
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
            None
        }
    };

    let components = EngineComponents::from_config(&config).context("failed to create providers")?;
    let engine = Arc::new(QueryEngine::new(components, config.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let metrics_port = config.observability.metrics_port;
    if let Some(handle) = prometheus.clone().filter(|_| metrics_port != 0 && metrics_port != config.server.port) {
        let metrics_addr = SocketAddr::new(addr.ip(), metrics_port);
        tokio::spawn(serve_metrics(metrics_addr, handle));
    }

    let app = create_router(AppState::new(engine, prometheus));

    info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    shutdown.cancel();

    let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined.context("server task panicked")??,
        Err(_) => warn!(timeout_secs = grace.as_secs(), "Graceful shutdown timed out"),
    }

    info!("Lodestar context service stopped");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Standalone exporter when metrics get their own port
async fn serve_metrics(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new().route("/metrics", get(move || std::future::ready(handle.render())));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "Metrics exporter listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics exporter stopped");
            }
        }
        Err(e) => error!(%addr, error = %e, "Failed to bind metrics exporter"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

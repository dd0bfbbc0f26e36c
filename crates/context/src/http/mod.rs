//! HTTP surface for the context engine
//!
//! Routes:
//! - `POST /v1/answer` ask a question
//! - `POST /v1/documents` index or replace documents
//! - `DELETE /v1/documents/{id}` drop a document
//! - `GET /v1/index/stats` index snapshot statistics
//! - `GET /health`, `GET /ready`, `GET /metrics`

pub mod handlers;
pub mod middleware;

use crate::engine::QueryEngine;
use axum::{
    routing::{delete, get, post},
    Router,
};
use lodestar_common::config::AppConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub config: Arc<AppConfig>,
    /// Present when the Prometheus recorder is installed in this process
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: Arc<QueryEngine>, metrics: Option<PrometheusHandle>) -> Self {
        let config = Arc::new(engine.config().clone());
        Self {
            engine,
            config,
            metrics,
        }
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/v1/answer", post(handlers::answer::answer))
        .route("/v1/documents", post(handlers::documents::index_documents))
        .route("/v1/documents/{id}", delete(handlers::documents::remove_document))
        .route("/v1/index/stats", get(handlers::health::index_stats))
        .route_layer(axum::middleware::from_fn(middleware::track_metrics))
        .layer(ConcurrencyLimitLayer::new(
            state.config.server.max_concurrent_requests.max(1),
        ));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .merge(api)
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

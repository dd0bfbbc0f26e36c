//! Health, readiness, stats and metrics handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lodestar_search::IndexStats;
use serde::Serialize;
use std::time::Instant;

use crate::http::AppState;
use lodestar_common::errors::Result;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub embedder: CheckResult,
    pub vector_store: CheckResult,
    pub index: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn up(started: Instant, detail: Option<String>) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            detail,
            error: None,
        }
    }

    fn down(error: impl ToString) -> Self {
        Self {
            status: "down".to_string(),
            latency_ms: None,
            detail: None,
            error: Some(error.to_string()),
        }
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: lodestar_common::VERSION.to_string(),
    })
}

/// Readiness probe - checks the embedder and vector store
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let started = Instant::now();
    let embedder = match state.engine.probe_embedder().await {
        Ok(()) => CheckResult::up(started, None),
        Err(e) => CheckResult::down(e),
    };

    let started = Instant::now();
    let vector_store = match state.engine.probe_vector_store().await {
        Ok(count) => CheckResult::up(started, Some(format!("{} vectors", count))),
        Err(e) => CheckResult::down(e),
    };

    let started = Instant::now();
    let stats = state.engine.index_stats().await;
    let index = CheckResult::up(
        started,
        Some(format!("version {}, {} documents", stats.version, stats.documents)),
    );

    let all_healthy = embedder.is_up() && vector_store.is_up() && index.is_up();
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                embedder,
                vector_store,
                index,
            },
        }),
    )
}

/// Statistics of the current index snapshot
pub async fn index_stats(State(state): State<AppState>) -> Result<Json<IndexStats>> {
    Ok(Json(state.engine.index_stats().await))
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

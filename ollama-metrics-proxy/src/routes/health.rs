//! Health check and metrics endpoints, served on the metrics listener.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.proxy.health_check().await;
    state.collector.set_backend_healthy(backend.is_ok());

    let (status, backend_status, error) = match backend {
        Ok(()) => (StatusCode::OK, "connected", None),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, "disconnected", Some(e.to_string())),
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "ollama": backend_status,
            "ollama_url": state.proxy.base_url(),
            "error": error,
            "queue": state.queue.stats(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Prometheus text exposition
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.collector.encode(),
    )
}

/// Queue statistics
///
/// GET /stats
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.stats())
}

/// Ready check (for Kubernetes)
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.proxy.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}

//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::shard::ShardState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_healthy: bool,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shard_count: u32,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub events_received: u64,
    /// Mean heartbeat round trip; null until measured
    pub latency_ms: Option<u64>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_healthy: state.shard_state.is_healthy(),
    })
}

fn ready_response(state: &ShardState) -> ReadyResponse {
    ReadyResponse {
        ready: state.is_ready(),
        shard_count: state.total_shards(),
        shards_total: state.shard_count(),
        shards_ready: state.ready_shards(),
        events_received: state.total_events_received(),
        latency_ms: state.mean_latency().map(|latency| latency.as_millis() as u64),
    }
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_response(&state.shard_state);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards(
        state.shard_state.ready_shards(),
        state.shard_state.shard_count(),
    );

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

//! Admin HTTP surface: health, usage stats, Prometheus metrics.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::worker::BlockWorker;

pub struct AppState {
    pub worker: BlockWorker,
    pub start_time: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "worker_id": state.worker.worker_id(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.worker.store_meta().await)
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Refresh the capacity gauges before rendering.
    let _ = state.worker.store_meta().await;
    state.worker.metrics().render()
}

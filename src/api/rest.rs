// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The renderer surface. The engine publishes per-symbol rows once per tick;
// consumers poll `/api/v1/rows` (or the full `/api/v1/state` snapshot) and use
// `state_version` to detect fresh data. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/rows", get(rows))
        .route("/api/v1/state", get(full_state))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    feed_connected: bool,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        feed_connected: state.feed.is_connected(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn rows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows = state.rows.read().clone();
    Json(rows)
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

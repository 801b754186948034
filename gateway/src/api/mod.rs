use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /admin/workers: every worker registration
pub async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.workers.snapshot().await)
}

/// GET /admin/ledger: call ledger and external drop box counters
pub async fn ledger_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = state.ledger.settings();
    Json(json!({
        "trackedCalls": state.ledger.len().await,
        "pendingExternalResults": state.external_results.len(),
        "defaultTtlMs": settings.default_ttl.as_millis() as u64,
        "sweepIntervalMs": settings.sweep_interval.as_millis() as u64,
    }))
}

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use shared_types::{CallStatus, ExpiryTimeWrite, ProgressWrite, ResultWrite};
use tracing::debug;

use crate::{error::ApiError, AppState};

fn require_call_id(call_id: Option<String>) -> Result<String, ApiError> {
    call_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("callId is required".to_string()))
}

/// PUT /internalWebhook/result
pub async fn put_result(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResultWrite>,
) -> Result<Json<Value>, ApiError> {
    let call_id = require_call_id(body.call_id)?;
    state.ledger.store_result(&call_id, body.result).await;
    debug!(call_id, "call result stored");
    Ok(Json(json!({ "status": "ok" })))
}

/// PUT /internalWebhook/progress
pub async fn put_progress(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProgressWrite>,
) -> Result<Json<Value>, ApiError> {
    let call_id = require_call_id(body.call_id)?;
    state.ledger.store_progress(&call_id, body.progress).await;
    debug!(call_id, "call progress stored");
    Ok(Json(json!({ "status": "ok" })))
}

/// PUT /internalWebhook/expiryTime: `expiryTime` in milliseconds
pub async fn put_expiry_time(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExpiryTimeWrite>,
) -> Result<Json<Value>, ApiError> {
    let call_id = require_call_id(body.call_id)?;
    let millis = body
        .expiry_time
        .ok_or_else(|| ApiError::BadRequest("expiryTime is required".to_string()))?;
    state
        .ledger
        .set_expiry(&call_id, Duration::from_millis(millis))
        .await;
    Ok(Json(json!({ "status": "ok" })))
}

/// GET /internalWebhook/{call_id}
///
/// Each poll dequeues at most one progress entry. A stored result makes the
/// call `completed` even while progress is still queued.
pub async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Json<CallStatus> {
    let result = state.ledger.get_result(&call_id).await;
    let progress = state
        .ledger
        .consume_progress(&call_id)
        .await
        .map(|entry| entry.value);

    Json(match result {
        Some(record) => CallStatus::Completed {
            result: record.value,
            progress,
        },
        None => CallStatus::Pending { progress },
    })
}

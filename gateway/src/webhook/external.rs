use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use shared_types::{ExternalResultRead, ExternalResultWrite};
use tracing::debug;

use crate::{error::ApiError, AppState};

/// Results pushed once by third parties; each is handed out exactly once.
#[derive(Debug, Default)]
pub struct ExternalResults {
    entries: DashMap<String, Value>,
}

impl ExternalResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` under `id`, replacing anything unread.
    pub fn put(&self, id: &str, data: Value) {
        self.entries.insert(id.to_string(), data);
    }

    /// Remove and return the entry for `id`.
    pub fn take(&self, id: &str) -> Option<Value> {
        self.entries.remove(id).map(|(_, data)| data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// PUT|POST /externalWebhook/result
pub async fn put_result(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExternalResultWrite>,
) -> Result<Json<Value>, ApiError> {
    let id = body
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("id is required".to_string()))?;
    state.external_results.put(&id, body.data);
    debug!(id, "external result stored");
    Ok(Json(json!({ "status": "ok" })))
}

/// GET /externalWebhook/{id}
pub async fn take_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExternalResultRead>, ApiError> {
    let result = state
        .external_results
        .take(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no result for {id}")))?;
    Ok(Json(ExternalResultRead::Completed { result }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_is_single_shot() {
        let results = ExternalResults::new();
        results.put("job-1", json!({"ok": true}));
        results.put("job-1", json!({"ok": false}));

        assert_eq!(results.take("job-1"), Some(json!({"ok": false})));
        assert_eq!(results.take("job-1"), None);
        assert!(results.is_empty());
    }
}

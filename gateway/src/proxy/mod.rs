//! Command proxy: HTTP façade over the worker registry.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use shared_types::{CommandEnvelope, RestartReply};
use tracing::{error, info};

use crate::{error::ApiError, worker::WorkerError, AppState};

/// PUT /proxy/executeCommand/{worker_id}
///
/// The worker's `{statusCode, result|err}` reply is relayed as-is with 200.
pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(envelope): Json<CommandEnvelope>,
) -> Result<Response, ApiError> {
    let body = serde_json::to_value(&envelope)
        .map_err(|e| ApiError::BadRequest(format!("invalid command envelope: {e}")))?;
    let forwarded = state
        .workers
        .forward(
            &worker_id,
            "/executeCommand",
            reqwest::Method::POST,
            Some(&body),
        )
        .await
        .map_err(|e| {
            if !matches!(e, WorkerError::NotFound(_)) {
                error!(%worker_id, command = %envelope.name, "execute command failed: {e}");
            }
            e
        })?;
    Ok((StatusCode::OK, Json(forwarded.body)).into_response())
}

/// PUT /proxy/setEnv/{worker_id}
///
/// Body is an optional env map. Without one the secret store's `env` container
/// is used, and without that the gateway's own environment.
pub async fn set_env(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    body: Bytes,
) -> Result<Json<RestartReply>, ApiError> {
    let overrides = parse_env_body(&body)?;
    let new_url = state
        .workers
        .restart_with_env(&worker_id, overrides)
        .await?;
    info!(%worker_id, %new_url, "worker restarted with new environment");
    Ok(Json(RestartReply {
        status_code: StatusCode::OK.as_u16(),
        message: format!("worker {worker_id} restarted"),
        new_url,
    }))
}

/// GET /proxy/ready/{worker_id}
pub async fn ready(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Response, ApiError> {
    let forwarded = state
        .workers
        .forward(&worker_id, "/ready", reqwest::Method::GET, None)
        .await?;
    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(forwarded.body)).into_response())
}

/// Env map from a setEnv body. Empty and `null` bodies mean "no overrides";
/// non-string values are stringified.
fn parse_env_body(body: &[u8]) -> Result<HashMap<String, String>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    let parsed: Option<HashMap<String, Value>> = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("env must be a JSON object: {e}")))?;
    Ok(parsed
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_body() {
        assert!(parse_env_body(b"").unwrap().is_empty());
        assert!(parse_env_body(b"  null ").unwrap().is_empty());

        let env = parse_env_body(br#"{"API_KEY":"abc","LIMIT":5,"DEBUG":true}"#).unwrap();
        assert_eq!(env["API_KEY"], "abc");
        assert_eq!(env["LIMIT"], "5");
        assert_eq!(env["DEBUG"], "true");

        assert!(matches!(
            parse_env_body(b"[1,2]"),
            Err(ApiError::BadRequest(_))
        ));
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::worker::WorkerError;

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) | ApiError::Timeout(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::NotFound(_) => ApiError::NotFound(e.to_string()),
            WorkerError::ReadyTimeout { .. } => ApiError::Timeout(e.to_string()),
            WorkerError::Spawn(_)
            | WorkerError::MissingStdio(_)
            | WorkerError::Ipc(_)
            | WorkerError::Rejected(_)
            | WorkerError::Exited(_)
            | WorkerError::Transport(_) => ApiError::Upstream(e.to_string()),
            WorkerError::Secrets(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, "request failed: {self}");
        }
        (
            status,
            Json(json!({ "statusCode": status.as_u16(), "message": self.to_string() })),
        )
            .into_response()
    }
}

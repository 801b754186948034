//! Plugin worker gateway
//!
//! Supervises long-lived plugin worker processes, proxies commands to them, and
//! keeps a TTL ledger of call progress/results that short-lived handlers poll
//! instead of holding a connection open.

pub mod api;
pub mod config;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod proxy;
pub mod secrets;
pub mod state;
pub mod webhook;
pub mod worker;

use std::sync::Arc;

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Configure all gateway routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        // Admin
        .route("/admin/workers", get(api::list_workers))
        .route("/admin/ledger", get(api::ledger_stats))
        // Command proxy
        .route(
            "/proxy/executeCommand/{worker_id}",
            put(proxy::execute_command),
        )
        .route("/proxy/setEnv/{worker_id}", put(proxy::set_env))
        .route("/proxy/ready/{worker_id}", get(proxy::ready))
        // Internal webhook (call ledger)
        .route("/internalWebhook/result", put(webhook::internal::put_result))
        .route(
            "/internalWebhook/progress",
            put(webhook::internal::put_progress),
        )
        .route(
            "/internalWebhook/expiryTime",
            put(webhook::internal::put_expiry_time),
        )
        .route("/internalWebhook/{call_id}", get(webhook::internal::get_call))
        // External webhook (single-shot results)
        .route(
            "/externalWebhook/result",
            put(webhook::external::put_result).post(webhook::external::put_result),
        )
        .route(
            "/externalWebhook/{id}",
            get(webhook::external::take_result),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

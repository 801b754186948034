//! Webhook and proxy HTTP API tests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gateway::ledger::{CallLedger, DelimitedOwnerResolver, LedgerSettings};
use gateway::secrets::NoSecrets;
use gateway::webhook::external::ExternalResults;
use gateway::worker::{SupervisorSettings, WorkerRegistry};
use gateway::AppState;

fn setup_test_app() -> (axum::Router, Arc<AppState>) {
    let ledger = CallLedger::new(
        LedgerSettings::default(),
        Arc::new(DelimitedOwnerResolver::default()),
    );
    let workers = WorkerRegistry::new(
        SupervisorSettings::default(),
        Arc::clone(&ledger),
        Arc::new(NoSecrets),
    )
    .expect("failed to build registry");
    let state = Arc::new(AppState {
        ledger,
        workers,
        external_results: ExternalResults::new(),
    });
    (gateway::router(Arc::clone(&state)), state)
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    let value: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("invalid json")
    };
    (status, value)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("failed to build request")
}

#[tokio::test]
async fn test_health() {
    let (app, _state) = setup_test_app();
    let (status, body) = json_response(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_progress_then_result() {
    let (app, _state) = setup_test_app();

    for step in [1, 2] {
        let (status, body) = json_response(
            &app,
            json_request(
                "PUT",
                "/internalWebhook/progress",
                json!({"callId": "w1:c1", "progress": {"step": step}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    let (status, body) = json_response(&app, get("/internalWebhook/w1:c1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "pending", "progress": {"step": 1}}));

    let (status, _) = json_response(
        &app,
        json_request(
            "PUT",
            "/internalWebhook/result",
            json!({"callId": "w1:c1", "result": {"answer": 42}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Result dominates; the remaining progress entry still drains.
    let (_, body) = json_response(&app, get("/internalWebhook/w1:c1")).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"], json!({"answer": 42}));
    assert_eq!(body["progress"], json!({"step": 2}));

    let (_, body) = json_response(&app, get("/internalWebhook/w1:c1")).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], Value::Null);
}

#[tokio::test]
async fn test_later_result_overwrites() {
    let (app, _state) = setup_test_app();
    for value in ["first", "second"] {
        json_response(
            &app,
            json_request(
                "PUT",
                "/internalWebhook/result",
                json!({"callId": "c2", "result": value}),
            ),
        )
        .await;
    }
    let (_, body) = json_response(&app, get("/internalWebhook/c2")).await;
    assert_eq!(body["result"], "second");
}

#[tokio::test]
async fn test_unknown_call_is_pending() {
    let (app, _state) = setup_test_app();
    let (status, body) = json_response(&app, get("/internalWebhook/nobody")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["progress"], Value::Null);
}

#[tokio::test]
async fn test_missing_call_id_is_rejected() {
    let (app, state) = setup_test_app();

    for (uri, body) in [
        ("/internalWebhook/result", json!({"result": 1})),
        ("/internalWebhook/progress", json!({"callId": "", "progress": 1})),
        ("/internalWebhook/expiryTime", json!({"expiryTime": 1000})),
    ] {
        let (status, body) = json_response(&app, json_request("PUT", uri, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["message"], "callId is required");
    }
    assert!(state.ledger.is_empty().await);
}

#[tokio::test]
async fn test_expiry_time_requires_value() {
    let (app, state) = setup_test_app();

    let (status, _) = json_response(
        &app,
        json_request("PUT", "/internalWebhook/expiryTime", json!({"callId": "c3"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = json_response(
        &app,
        json_request(
            "PUT",
            "/internalWebhook/expiryTime",
            json!({"callId": "c3", "expiryTime": 60000}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.ledger.len().await, 1);
}

#[tokio::test]
async fn test_external_result_is_single_shot() {
    let (app, _state) = setup_test_app();

    let (status, _) = json_response(
        &app,
        json_request(
            "POST",
            "/externalWebhook/result",
            json!({"id": "ext-1", "data": {"paid": true}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = json_response(&app, get("/externalWebhook/ext-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "completed", "result": {"paid": true}}));

    let (status, _) = json_response(&app, get("/externalWebhook/ext-1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_external_result_requires_id() {
    let (app, state) = setup_test_app();
    let (status, body) = json_response(
        &app,
        json_request("PUT", "/externalWebhook/result", json!({"data": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "id is required");
    assert!(state.external_results.is_empty());
}

#[tokio::test]
async fn test_proxy_unknown_worker_is_not_found() {
    let (app, _state) = setup_test_app();

    let (status, _) = json_response(
        &app,
        json_request(
            "PUT",
            "/proxy/executeCommand/ghost",
            json!({"name": "echo", "pluginName": "ghost", "args": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_response(
        &app,
        json_request("PUT", "/proxy/setEnv/ghost", json!({"A": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_response(&app, get("/proxy/ready/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_endpoints() {
    let (app, state) = setup_test_app();
    state.external_results.put("x", json!(1));
    state.ledger.store_progress("w:1", json!(1)).await;

    let (status, body) = json_response(&app, get("/admin/workers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = json_response(&app, get("/admin/ledger")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trackedCalls"], 1);
    assert_eq!(body["pendingExternalResults"], 1);
    assert_eq!(body["defaultTtlMs"], 300_000);
}

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chat_dispatcher::dispatch::{DispatcherConfig, ResultSink, Submission};
use chat_dispatcher::engine::{EchoEngine, InferenceError};
use chat_dispatcher::test_util::{create_test_state, ManualEngine};
use chat_dispatcher::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn config(workers: usize, capacity: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_count: workers,
        queue_capacity: capacity,
        ..DispatcherConfig::default()
    }
}

fn echo_state(workers: usize) -> Arc<AppState> {
    create_test_state(Arc::new(EchoEngine::new(Duration::from_millis(5))), config(workers, 4))
}

async fn send_request(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Option<String>, String) {
    let mut req_builder = Request::builder().method(method).uri(uri);

    if body.is_some() {
        req_builder = req_builder.header("Content-Type", "application/json");
    }

    let req = req_builder
        .body(match body {
            Some(b) => Body::from(b.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, retry_after, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health_reports_dispatcher_stats() {
    let app = app(echo_state(2));

    let (status, _, body) = send_request(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"], "echo");
    assert_eq!(body["dispatcher"]["worker_count"], 2);
    assert_eq!(body["dispatcher"]["idle_workers"], 2);
    assert_eq!(body["dispatcher"]["queue_capacity"], 4);
    assert!(body["dispatcher"]["oldest_session_opened_at"].is_null());
}

#[tokio::test]
async fn test_metrics_exposes_gauges() {
    let app = app(echo_state(3));

    let (status, _, body) = send_request(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("dispatch_workers_total 3"));
    assert!(body.contains("dispatch_queue_depth 0"));
}

#[tokio::test]
async fn test_chat_round_trip() {
    let app = app(echo_state(1));

    let (status, _, body) = send_request(&app, Method::POST, "/chat", Some(json!({"input_text": "hello"}))).await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["response"], "Model response: olleh");
    assert_eq!(body["request_id"], 1);
}

#[tokio::test]
async fn test_chat_queue_full_is_503_with_retry_after() {
    let engine = Arc::new(ManualEngine::new());
    let state = create_test_state(engine.clone(), config(1, 1));
    let app = app(state.clone());

    let (busy_sink, _busy_rx) = ResultSink::oneshot();
    state.dispatcher.submit(Submission::new("busy"), busy_sink).await.unwrap();
    let (queued_sink, _queued_rx) = ResultSink::oneshot();
    state.dispatcher.submit(Submission::new("queued"), queued_sink).await.unwrap();

    let (status, retry_after, body) =
        send_request(&app, Method::POST, "/chat", Some(json!({"input_text": "one too many"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(retry_after.as_deref(), Some("1"));

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["type"], "queue_full");
    assert_eq!(body["error"]["retryable"], true);
}

#[tokio::test]
async fn test_chat_deadline_is_504() {
    let engine = Arc::new(ManualEngine::interruptible());
    let app = app(create_test_state(engine, config(1, 4)));

    let (status, _, body) = send_request(
        &app,
        Method::POST,
        "/chat",
        Some(json!({"input_text": "slow", "deadline_ms": 50})),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["type"], "timeout");
}

#[tokio::test]
async fn test_chat_inference_failure_is_502() {
    let engine = Arc::new(ManualEngine::new());
    let app = app(create_test_state(engine.clone(), config(1, 4)));

    let pending = tokio::spawn({
        let app = app.clone();
        async move { send_request(&app, Method::POST, "/chat", Some(json!({"input_text": "boom"}))).await }
    });
    engine
        .next_call()
        .await
        .complete(Err(InferenceError::Failed("model crashed".to_string())));

    let (status, _, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["type"], "inference_error");
    assert_eq!(body["error"]["message"], "Inference failed: model crashed");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn test_chat_after_shutdown_is_503() {
    let state = echo_state(1);
    let app = app(state.clone());
    state.dispatcher.shutdown().await;

    let (status, _, body) = send_request(&app, Method::POST, "/chat", Some(json!({"input_text": "hi"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["type"], "shutting_down");

    let (_, _, health) = send_request(&app, Method::GET, "/health", None).await;
    let health: Value = serde_json::from_str(&health).unwrap();
    assert_eq!(health["status"], "shutting_down");
}

#[tokio::test]
async fn test_chat_rejects_malformed_body() {
    let app = app(echo_state(1));

    let (status, _, _) = send_request(&app, Method::POST, "/chat", Some(json!({"prompt": "wrong field"}))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_nonexistent_route_returns_404() {
    let app = app(echo_state(1));

    let (status, _, _) = send_request(&app, Method::GET, "/nonexistent", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

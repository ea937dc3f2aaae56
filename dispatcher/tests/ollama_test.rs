use std::sync::Arc;
use std::time::Duration;

use chat_dispatcher::dispatch::{Dispatcher, DispatcherConfig, Submission};
use chat_dispatcher::engine::{InferenceEngine, InferenceError, OllamaEngine};
use chat_dispatcher::error::Stage;
use chat_dispatcher::DispatchError;
use serde_json::json;
use tokio::time::Instant;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_generate(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "test-model", "stream": false})))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_infer_returns_generated_text() {
    let server = MockServer::start().await;
    mock_generate(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"response": "Hello there", "done": true})),
    )
    .await;

    let engine = OllamaEngine::new(&server.uri(), "test-model");
    assert_eq!(engine.infer("Hi", None).await, Ok("Hello there".to_string()));
    assert!(engine.supports_interrupt());
}

#[tokio::test]
async fn test_infer_http_error_is_failure() {
    let server = MockServer::start().await;
    mock_generate(&server, ResponseTemplate::new(500).set_body_string("out of memory")).await;

    let engine = OllamaEngine::new(&server.uri(), "test-model");
    match engine.infer("Hi", None).await {
        Err(InferenceError::Failed(msg)) => {
            assert!(msg.starts_with("HTTP 500"), "unexpected message: {}", msg);
            assert!(msg.contains("out of memory"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_infer_honours_deadline() {
    let server = MockServer::start().await;
    mock_generate(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({"response": "too late"}))
            .set_delay(Duration::from_secs(2)),
    )
    .await;

    let engine = OllamaEngine::new(&server.uri(), "test-model");
    let deadline = Instant::now() + Duration::from_millis(100);
    assert_eq!(engine.infer("Hi", Some(deadline)).await, Err(InferenceError::Timeout));
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    let engine = OllamaEngine::new(&server.uri(), "test-model");
    assert!(engine.health_check().await.is_ok());

    let unreachable = OllamaEngine::new("http://127.0.0.1:1", "test-model");
    assert!(unreachable.health_check().await.is_err());
}

#[tokio::test]
async fn test_dispatcher_over_ollama() {
    let server = MockServer::start().await;
    mock_generate(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({"response": "dispatched"})),
    )
    .await;

    let engine = Arc::new(OllamaEngine::new(&server.uri(), "test-model"));
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), engine);

    let completion = dispatcher.submit_and_wait(Submission::new("prompt")).await.unwrap();
    assert_eq!(completion.output, "dispatched");
}

#[tokio::test]
async fn test_dispatcher_interrupts_slow_ollama_call() {
    let server = MockServer::start().await;
    mock_generate(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({"response": "too late"}))
            .set_delay(Duration::from_secs(5)),
    )
    .await;

    let engine = Arc::new(OllamaEngine::new(&server.uri(), "test-model"));
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), engine);

    let result = dispatcher
        .submit_and_wait(Submission::new("prompt").with_deadline(Duration::from_millis(100)))
        .await;
    assert_eq!(result, Err(DispatchError::Timeout(Stage::Inference)));
}

//! Wire-level tests for the Ollama adapter against a mock HTTP server.

use std::time::{Duration, Instant};

use crucible::backend::ollama::OllamaBackend;
use crucible::backend::{GenerateRequest, InferenceBackend};
use crucible::error::CrucibleError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GB: u64 = 1024 * 1024 * 1024;

/// The adapter appends `:port` itself, so split the mock address.
fn backend_for(server: &MockServer) -> (OllamaBackend, u16) {
    let addr = server.address();
    (OllamaBackend::new(format!("http://{}", addr.ip())), addr.port())
}

fn generate_request(port: u16) -> GenerateRequest {
    GenerateRequest {
        model: "qwen2.5-coder:14b".to_string(),
        port,
        prompt: "write code".to_string(),
        system: Some("be terse".to_string()),
        num_ctx: Some(8192),
        deadline: Instant::now() + Duration::from_secs(10),
        idle_timeout: Duration::from_secs(5),
        cancellation_token: None,
    }
}

#[tokio::test]
async fn list_models_converts_bytes_to_gb() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [
                { "name": "qwen2.5-coder:14b", "size": 9 * GB },
                { "name": "phi4:14b", "size": 9 * GB },
            ]
        })))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let models = backend.list_models(port).await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].name, "qwen2.5-coder:14b");
    assert!((models[0].size_gb - 9.0).abs() < 1e-9);
}

#[tokio::test]
async fn list_running_prefers_vram_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/ps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [
                { "name": "qwen2.5-coder:14b", "size": 14 * GB, "size_vram": 9 * GB },
            ]
        })))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let running = backend.list_running(port).await.unwrap();
    assert_eq!(running.len(), 1);
    assert!((running[0].resident_gb - 9.0).abs() < 1e-9);
}

#[tokio::test]
async fn transient_list_failure_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{ "name": "phi4:14b", "size": 9 * GB }]
        })))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let models = backend.list_models(port).await.unwrap();
    assert_eq!(models.len(), 1);
}

#[tokio::test]
async fn persistent_list_failure_is_registry_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    assert!(matches!(
        backend.list_models(port).await,
        Err(CrucibleError::RegistryUnavailable)
    ));
}

#[tokio::test]
async fn generate_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "FILE: a.go\n```go\npackage main\n```",
            "total_duration": 123_000_000u64,
            "prompt_eval_count": 11,
            "eval_count": 42,
        })))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let outcome = backend.generate(&generate_request(port)).await.unwrap();
    assert!(outcome.response.starts_with("FILE: a.go"));
    assert_eq!(outcome.total_duration_ms, 123);
    assert_eq!(outcome.prompt_eval_count, 11);
    assert_eq!(outcome.eval_count, 42);
}

#[tokio::test]
async fn malformed_generate_payload_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "ok",
            "total_duration": 1_000_000u64,
        })))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let outcome = backend.generate(&generate_request(port)).await.unwrap();
    assert_eq!(outcome.response, "ok");
}

#[tokio::test]
async fn generate_error_status_is_malformed_after_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    assert!(matches!(
        backend.generate(&generate_request(port)).await,
        Err(CrucibleError::BackendMalformed(_))
    ));
}

#[tokio::test]
async fn stalled_generate_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "response": "late" }))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let request = GenerateRequest {
        deadline: Instant::now() + Duration::from_millis(500),
        idle_timeout: Duration::from_millis(200),
        ..generate_request(port)
    };

    let started = Instant::now();
    let result = backend.generate(&request).await;
    assert!(matches!(result, Err(CrucibleError::BackendTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_interrupts_generate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "response": "late" }))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let (backend, port) = backend_for(&server);
    let token = tokio_util::sync::CancellationToken::new();
    let request = GenerateRequest {
        deadline: Instant::now() + Duration::from_secs(60),
        idle_timeout: Duration::from_secs(60),
        cancellation_token: Some(token.clone()),
        ..generate_request(port)
    };

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = backend.generate(&request).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    // Cancellation during the headers wait surfaces as timeout or
    // cancelled depending on where the call was suspended; either way it
    // returns promptly and never yields a payload.
    assert!(result.is_err());
}

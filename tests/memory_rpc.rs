//! JSON-RPC envelope handling for the memory-service adapter.

use crucible::error::CrucibleError;
use crucible::job::{ChangeType, GeneratedFile};
use crucible::memory::MemoryService;
use crucible::memory::rpc::MemoryRpcClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Wrap a payload in the dual-layer envelope: JSON-RPC result whose
/// content text carries the real JSON.
fn envelope(payload: &serde_json::Value) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "content": [ { "type": "text", "text": payload.to_string() } ]
        }
    })
}

#[tokio::test]
async fn model_stats_unwrap_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": { "name": "get_model_stats" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&json!({
            "stats": [
                { "model": "phi4:14b", "success_rate": 0.62, "avg_score": 7.0, "samples": 9 },
                { "model": "qwen2.5:7b", "success_rate": 0.91, "avg_score": 8.5, "samples": 30 },
            ]
        }))))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    let stats = client.get_model_stats("go", "validation").await.unwrap();
    assert_eq!(stats.len(), 2);
    // Ranked by success rate, best first.
    assert_eq!(stats[0].model, "qwen2.5:7b");
    assert_eq!(stats[0].samples, 30);
}

#[tokio::test]
async fn prompts_come_back_as_plain_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .and(body_partial_json(json!({
            "params": { "name": "manage_prompts" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {
                "content": [ { "type": "text", "text": "You are a code generator." } ]
            }
        })))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    let prompt = client.get_prompt("code_generation_system").await.unwrap();
    assert_eq!(prompt.as_deref(), Some("You are a code generator."));
}

#[tokio::test]
async fn rpc_error_objects_surface_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "unknown tool" }
        })))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    assert!(matches!(
        client.get_model_stats("go", "validation").await,
        Err(CrucibleError::MemoryServiceUnavailable(_))
    ));
}

#[tokio::test]
async fn http_failure_surfaces_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    assert!(matches!(
        client.get_prompt("code_generation_system").await,
        Err(CrucibleError::MemoryServiceUnavailable(_))
    ));
}

#[tokio::test]
async fn validate_imports_reports_invalid_symbols() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .and(body_partial_json(json!({
            "params": { "name": "validate_imports" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&json!({
            "invalid": ["pkg.DoesNotExist"]
        }))))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    let files = vec![GeneratedFile {
        path: "main.go".to_string(),
        content: "package main\nimport \"pkg\"\n".to_string(),
        language: "go".to_string(),
        change_type: ChangeType::Created,
        attempt: 1,
    }];
    let invalid = client.validate_imports(&files, None).await.unwrap();
    assert_eq!(invalid, vec!["pkg.DoesNotExist".to_string()]);
}

#[tokio::test]
async fn missing_plan_is_task_plan_missing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .and(body_partial_json(json!({
            "params": { "name": "generate_task_plan" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&json!({ "steps": [] }))))
        .mount(&server)
        .await;

    let client = MemoryRpcClient::new(server.uri());
    assert!(matches!(
        client.generate_task_plan("task", "go").await,
        Err(CrucibleError::TaskPlanMissing)
    ));
}

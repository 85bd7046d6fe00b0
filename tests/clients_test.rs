//! Tests for the shared API clients and the HTTP retrieval service,
//! against a local mock server.

use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muninn::MuninnError;
use muninn::pool::{ApiClientKind, ApiConfig, ResourcePool, RetryMode};
use muninn::services::{ChatTurn, HttpRetrievalService, RetrievalService};

fn config(server: &MockServer, max_attempts: u32, mode: RetryMode) -> ApiConfig {
    ApiConfig {
        max_attempts,
        retry_mode: mode,
        generation_endpoint: Some(server.uri()),
        retrieval_endpoint: Some(server.uri()),
        ..ApiConfig::default()
    }
}

async fn pool_for(config: ApiConfig) -> Arc<ResourcePool> {
    Arc::new(
        ResourcePool::builder()
            .without_database()
            .api(config)
            .build()
            .await,
    )
}

fn retrieval_body() -> Value {
    json!({
        "retrievalResults": [
            {
                "content": { "text": "Wildfires\nare driven by\ndrought and heat\nand wind" },
                "location": { "s3Location": { "uri": "s3://docs/wildfires.html" } },
                "score": 0.87
            },
            {
                "content": { "text": "Fuel loads matter" },
                "score": 0.42
            }
        ]
    })
}

// ============================================================================
// ApiClient
// ============================================================================

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 3, RetryMode::Standard)).await;
    let client = pool.get_api_client(ApiClientKind::Generation).unwrap();
    let response: Value = client.post_json("echo", &json!({})).await.unwrap();
    assert_eq!(response, json!({ "ok": true }));
}

#[tokio::test]
async fn rate_limit_honours_retry_after_in_adaptive_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 3, RetryMode::Adaptive)).await;
    let client = pool.get_api_client(ApiClientKind::Retrieval).unwrap();
    let response: Vec<u8> = client.post_json("anything", &json!({})).await.unwrap();
    assert_eq!(response, vec![1, 2, 3]);
}

#[tokio::test]
async fn exhausted_budget_returns_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(2)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 2, RetryMode::Adaptive)).await;
    let client = pool.get_api_client(ApiClientKind::Retrieval).unwrap();
    let err = client
        .post_json::<_, Value>("anything", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MuninnError::RateLimited { retry_after: Some(d) } if d.is_zero()));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 5, RetryMode::Standard)).await;
    let client = pool.get_api_client(ApiClientKind::Generation).unwrap();
    let err = client
        .post_json::<_, Value>("x", &json!({}))
        .await
        .unwrap_err();
    match err {
        MuninnError::Api { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "bad request");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn api_key_is_sent_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(ApiConfig {
        api_key: Some("sk-test".to_string()),
        ..config(&server, 1, RetryMode::Standard)
    })
    .await;
    let client = pool.get_api_client(ApiClientKind::Generation).unwrap();
    let _: Value = client.post_json("x", &json!({})).await.unwrap();
}

#[tokio::test]
async fn clients_are_shared_and_rebuilt_after_invalidation() {
    let pool = pool_for(ApiConfig::default()).await;

    let first = pool.get_api_client(ApiClientKind::Generation).unwrap();
    let again = pool.get_api_client(ApiClientKind::Generation).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    pool.invalidate_api_clients();
    assert!(!pool.pool_stats().api_clients_available);

    let rebuilt = pool.get_api_client(ApiClientKind::Retrieval).unwrap();
    assert_eq!(rebuilt.kind(), ApiClientKind::Retrieval);
    assert!(pool.pool_stats().api_clients_available);
    assert!(!Arc::ptr_eq(
        &first,
        &pool.get_api_client(ApiClientKind::Generation).unwrap()
    ));
}

// ============================================================================
// HttpRetrievalService
// ============================================================================

#[tokio::test]
async fn retrieve_maps_results_to_contexts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/knowledgebases/kb-1/retrieve"))
        .and(body_partial_json(json!({
            "retrievalQuery": { "text": "wildfire causes" },
            "retrievalConfiguration": { "vectorSearchConfiguration": { "numberOfResults": 2 } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(retrieval_body()))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 1, RetryMode::Standard)).await;
    let service = HttpRetrievalService::new(pool, "kb-1", "model-x");
    let contexts = service.retrieve("wildfire causes", 2).await.unwrap();

    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].document_reference, "s3://docs/wildfires.html");
    assert_eq!(
        contexts[0].top_lines,
        "Wildfires\nare driven by\ndrought and heat"
    );
    assert_eq!(contexts[0].score, 0.87);
    assert_eq!(contexts[1].document_reference, "");
}

#[tokio::test]
async fn answer_invokes_model_with_documents_and_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/knowledgebases/kb-1/retrieve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(retrieval_body()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/model/model-x/invoke"))
        .and(body_partial_json(json!({
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": 1000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "Drought and heat.\u{FFFD}" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 1, RetryMode::Standard)).await;
    let service = HttpRetrievalService::new(pool, "kb-1", "model-x");
    let history = vec![
        ChatTurn::user("hi"),
        ChatTurn::assistant("Hello! Ask me about public lands."),
    ];
    let answer = service
        .answer("What causes wildfires?", &history)
        .await
        .unwrap();

    assert_eq!(answer.text, "Drought and heat.");
    assert_eq!(answer.references.len(), 2);
    assert_eq!(answer.references[0].source, "s3://docs/wildfires.html");

    let requests = server.received_requests().await.unwrap();
    let invoke = requests
        .iter()
        .find(|r| r.url.path() == "/model/model-x/invoke")
        .unwrap();
    let body: Value = serde_json::from_slice(&invoke.body).unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "hi");
    let prompt = messages[2]["content"][0]["text"].as_str().unwrap();
    assert!(prompt.contains("What causes wildfires?"));
    assert!(prompt.contains("Fuel loads matter"));
}

#[tokio::test]
async fn answer_forwards_only_recent_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/knowledgebases/kb-1/retrieve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "retrievalResults": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/model/m/invoke"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "content": [{ "text": "ok" }] })),
        )
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 1, RetryMode::Standard)).await;
    let service = HttpRetrievalService::new(pool, "kb-1", "m");
    let history: Vec<ChatTurn> = (0..10).map(|i| ChatTurn::user(format!("turn {i}"))).collect();
    service.answer("q", &history).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let invoke = requests
        .iter()
        .find(|r| r.url.path() == "/model/m/invoke")
        .unwrap();
    let body: Value = serde_json::from_slice(&invoke.body).unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 7);
    assert_eq!(messages[0]["content"], "turn 4");
}

#[tokio::test]
async fn retrieval_server_error_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let pool = pool_for(config(&server, 1, RetryMode::Standard)).await;
    let service = HttpRetrievalService::new(pool, "kb-1", "m");
    let err = service.retrieve("q", 5).await.unwrap_err();
    assert!(matches!(err, MuninnError::Api { status: 500, .. }));
}

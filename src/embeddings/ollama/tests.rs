use super::*;
use crate::config::OllamaConfig;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_config(server: &MockServer) -> OllamaConfig {
    let address = server.address();
    OllamaConfig {
        host: address.ip().to_string(),
        port: address.port(),
        model: "nomic-embed-text".to_string(),
        batch_size: 2,
        retry_attempts: 3,
        retry_base_delay_ms: 1,
        ..OllamaConfig::default()
    }
}

fn tags_body() -> serde_json::Value {
    json!({
        "models": [
            {"name": "nomic-embed-text:latest", "size": 274302450, "digest": "0a109f422b47"},
            {"name": "llama3:8b"}
        ]
    })
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        retry_attempts: 4,
        retry_base_delay_ms: 250,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model(), "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, 4);
    assert_eq!(client.retry_base_delay, Duration::from_millis(250));
}

#[test]
fn client_builder_methods() {
    let client = OllamaClient::new(&OllamaConfig::default())
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(0)
        .with_retry_base_delay(Duration::from_millis(5));

    // At least one attempt is always made
    assert_eq!(client.retry_attempts, 1);
    assert_eq!(client.retry_base_delay, Duration::from_millis(5));
}

#[tokio::test]
async fn health_check_accepts_latest_tag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tags_body()))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let result = EmbeddingProvider::health_check(&client).await;
    assert!(result.is_ok(), "health check should pass: {:?}", result);
}

#[tokio::test]
async fn health_check_reports_missing_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let error = EmbeddingProvider::health_check(&client)
        .await
        .expect_err("missing model should fail the health check");
    assert!(matches!(error, RecallError::EmbeddingModelUnavailable(_)));
}

#[tokio::test]
async fn embed_batch_splits_requests_by_batch_size() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({
            "model": "nomic-embed-text",
            "input": ["first", "second"]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"input": ["third"]})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5, 0.5]]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let texts = vec![
        "first".to_string(),
        "second".to_string(),
        "third".to_string(),
    ];
    let embeddings = client
        .embed_batch(&texts)
        .await
        .expect("batch embedding should succeed");

    assert_eq!(
        embeddings,
        vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]
    );
}

#[tokio::test]
async fn embed_batch_rejects_count_mismatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": []})))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let result = client.embed_batch(&["only".to_string()]).await;
    assert!(matches!(
        result,
        Err(RecallError::EmbeddingModelUnavailable(_))
    ));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let result = client.embed_batch(&["retry me".to_string()]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&mock_config(&server)).expect("client should build");
    let result = client.embed_batch(&["missing".to_string()]).await;
    assert!(result.is_err());
}

//! Tool invocation over HTTP against a mock tool server

mod test_helpers;

use agentmesh::config::CoordinatorConfig;
use agentmesh::layers::ToolInvocation;
use agentmesh::protocol::{Intent, ProtocolMessage, Recipient};
use agentmesh::security::Claims;
use agentmesh::testing::mocks::{issue_test_token, MockProbe, TEST_SECRET};
use agentmesh::transport::RecipientFilter;
use agentmesh::{CoordError, Coordinator};
use serde_json::json;
use std::sync::Arc;
use test_helpers::next;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(endpoint: &str) -> CoordinatorConfig {
    CoordinatorConfig::from_toml_str(&format!(
        r#"
[coordinator]
id = "mesh-http"

[dispatch]
timeout_ms = 1000
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 5

[[tools]]
name = "weather.lookup"
version = "1.2"
endpoint = "{endpoint}"
required_scopes = ["weather:read"]
risk = "safe"
input_schema = {{ type = "object", required = ["city"] }}
"#
    ))
    .unwrap()
}

async fn coordinator(server: &MockServer) -> Coordinator {
    let mut coordinator = Coordinator::builder(config(&format!("{}/invoke", server.uri())))
        .with_probe(Arc::new(MockProbe::new()))
        .with_signing_secret(TEST_SECRET)
        .build()
        .await
        .unwrap();
    coordinator.start().await.unwrap();
    coordinator
}

#[tokio::test]
async fn test_tool_request_message_dispatched_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(header_exists("Idempotency-Key"))
        .and(body_partial_json(json!({
            "tool": "weather.lookup",
            "version": "1.2",
            "arguments": {"city": "Oslo"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"temp_c": 4}})))
        .expect(1)
        .mount(&server)
        .await;
    let coordinator = coordinator(&server).await;
    let token = issue_test_token(coordinator.security(), "planner", &["weather:read"]);

    let request = ProtocolMessage::new(
        Intent::ToolRequest,
        "planner",
        Recipient::Tool("weather.lookup".to_string()),
        json!({"tool": "weather.lookup", "arguments": {"city": "Oslo"}, "auth_token": token}),
    );
    let mut inbox = coordinator.subscribe(RecipientFilter::agent("planner"));
    assert!(
        coordinator
            .submit(serde_json::to_value(&request).unwrap())
            .await
            .accepted
    );

    let reply = next(&mut inbox).await;
    assert_eq!(reply.intent, Intent::ToolResponse);
    assert_eq!(reply.payload["result"]["temp_c"], 4);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"temp_c": 11})))
        .mount(&server)
        .await;
    let coordinator = coordinator(&server).await;
    let token = issue_test_token(coordinator.security(), "planner", &["weather:read"]);

    let outcome = coordinator
        .mcp()
        .invoke(ToolInvocation::new("weather.lookup", token, json!({"city": "Bergen"})))
        .await
        .unwrap();
    assert_eq!(outcome.result, json!({"temp_c": 11}));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(coordinator.metrics().snapshot().invocations.dispatch_retries, 2);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown city"))
        .expect(1)
        .mount(&server)
        .await;
    let coordinator = coordinator(&server).await;
    let token = issue_test_token(coordinator.security(), "planner", &["weather:read"]);

    let err = coordinator
        .mcp()
        .invoke(ToolInvocation::new("weather.lookup", token, json!({"city": "Atlantis"})))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("unknown city"));
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_tool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;
    let coordinator = coordinator(&server).await;
    let token = issue_test_token(coordinator.security(), "planner", &["weather:read"]);

    let err = coordinator
        .mcp()
        .invoke(ToolInvocation::new("weather.lookup", token, json!({"town": "Oslo"})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Schema { .. }));
}

#[tokio::test]
async fn test_expired_token_is_an_authentication_error() {
    let server = MockServer::start().await;
    let coordinator = coordinator(&server).await;
    let issued_at = chrono::Utc::now().timestamp() as usize - 600;
    let token = coordinator
        .security()
        .tokens()
        .encode(&Claims {
            sub: "planner".to_string(),
            scopes: vec!["weather:read".to_string()],
            exp: issued_at + 60,
            iat: issued_at,
        })
        .unwrap();

    let err = coordinator
        .mcp()
        .invoke(ToolInvocation::new("weather.lookup", token, json!({"city": "Oslo"})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Authentication { .. }));
}

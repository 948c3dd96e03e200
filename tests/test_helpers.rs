//! Test helpers and utilities for integration tests

use agentmesh::config::CoordinatorConfig;
use agentmesh::protocol::{Intent, ProtocolMessage, Recipient};
use agentmesh::testing::mocks::{MockDispatcher, MockProbe, TEST_SECRET};
use agentmesh::transport::Subscription;
use agentmesh::Coordinator;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const COORDINATOR_ID: &str = "mesh-test";

/// Coordinator config with a safe search tool and a dangerous email tool
#[allow(dead_code)]
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::from_toml_str(&format!(
        r#"
[coordinator]
id = "{COORDINATOR_ID}"
description = "Integration test coordinator"

[limits]
step_timeout_secs = 2

[dispatch]
max_attempts = 2
initial_backoff_ms = 1
max_backoff_ms = 5

[circuit_breaker]
failure_threshold = 2
cooldown_ms = 200

[[tools]]
name = "search.web"
version = "1.0"
endpoint = "http://search-1"
required_scopes = ["search:read"]
risk = "safe"
input_schema = {{ type = "object", required = ["q"], properties = {{ q = {{ type = "string" }} }} }}

[[tools]]
name = "email.send"
version = "1.0"
endpoint = "http://mail-1"
required_scopes = ["email:send"]
risk = "dangerous"
"#
    ))
    .expect("test config should parse")
}

/// Build and start a coordinator around a scripted dispatcher
#[allow(dead_code)]
pub async fn start_coordinator(
    config: CoordinatorConfig,
    dispatcher: Arc<MockDispatcher>,
) -> Coordinator {
    let mut coordinator = Coordinator::builder(config)
        .with_dispatcher(dispatcher)
        .with_probe(Arc::new(MockProbe::new()))
        .with_signing_secret(TEST_SECRET)
        .build()
        .await
        .expect("coordinator should build");
    coordinator.start().await.expect("coordinator should start");
    coordinator
}

#[allow(dead_code)]
pub fn message(intent: Intent, sender: &str, recipient: Recipient, payload: Value) -> Value {
    serde_json::to_value(ProtocolMessage::new(intent, sender, recipient, payload))
        .expect("message should serialize")
}

/// Next message on a subscription, failing the test after two seconds
#[allow(dead_code)]
pub async fn next(subscription: &mut Subscription) -> ProtocolMessage {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("bus closed")
}

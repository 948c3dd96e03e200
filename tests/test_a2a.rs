//! Agent-to-agent messaging: ordering, negotiation, failover and rate limits

mod test_helpers;

use agentmesh::config::RateLimitRule;
use agentmesh::protocol::{ErrorCode, Intent, Recipient};
use agentmesh::registry::{AgentProfile, Liveness};
use agentmesh::testing::mocks::MockDispatcher;
use agentmesh::transport::RecipientFilter;
use agentmesh::Coordinator;
use serde_json::json;
use std::sync::Arc;
use test_helpers::{message, next, start_coordinator, test_config, COORDINATOR_ID};

async fn with_agents(config: agentmesh::config::CoordinatorConfig) -> Coordinator {
    let coordinator = start_coordinator(config, Arc::new(MockDispatcher::new())).await;
    let agents = coordinator.agents();
    agents
        .register(AgentProfile::new(
            "planner",
            "local://planner",
            ["planning", "summarize"],
        ))
        .unwrap();
    agents
        .register(AgentProfile::new(
            "writer",
            "local://writer",
            ["drafting", "summarize", "translate"],
        ))
        .unwrap();
    agents
        .register(AgentProfile::new(
            "editor",
            "local://editor",
            ["drafting", "proofreading"],
        ))
        .unwrap();
    coordinator
}

fn direct(to: &str, session: &str, body: serde_json::Value) -> serde_json::Value {
    message(
        Intent::AgentDirect,
        "planner",
        Recipient::Agent(to.to_string()),
        json!({"session_id": session, "capability": "drafting", "body": body}),
    )
}

#[tokio::test]
async fn test_direct_messages_arrive_in_send_order() {
    let coordinator = with_agents(test_config()).await;
    let mut writer = coordinator.subscribe(RecipientFilter::agent("writer"));

    for i in 0..10 {
        let result = coordinator
            .submit(direct("writer", "session-1", json!({"part": i})))
            .await;
        assert!(result.accepted);
    }

    for i in 0..10u64 {
        let forwarded = next(&mut writer).await;
        assert_eq!(forwarded.intent, Intent::AgentDirect);
        assert_eq!(forwarded.metadata.sender, "planner");
        assert_eq!(forwarded.payload["sequence"], i);
        assert_eq!(forwarded.payload["session_id"], "session-1");
        assert_eq!(forwarded.payload["body"]["part"], i);
        assert!(forwarded.metadata.causation_id.is_some());
    }
}

#[tokio::test]
async fn test_sequences_are_independent_per_session() {
    let coordinator = with_agents(test_config()).await;
    let mut writer = coordinator.subscribe(RecipientFilter::agent("writer"));

    coordinator
        .submit(direct("writer", "session-a", json!("a0")))
        .await;
    let first = next(&mut writer).await;
    coordinator
        .submit(direct("writer", "session-b", json!("b0")))
        .await;
    let second = next(&mut writer).await;

    assert_eq!(first.payload["sequence"], 0);
    assert_eq!(second.payload["sequence"], 0);
}

#[tokio::test]
async fn test_offline_agent_fails_over_to_capable_peer() {
    let coordinator = with_agents(test_config()).await;
    coordinator
        .agents()
        .set_liveness("writer", Liveness::Offline);
    let mut editor = coordinator.subscribe(RecipientFilter::agent("editor"));

    let result = coordinator
        .submit(direct("writer", "session-1", json!("draft intro")))
        .await;
    assert!(result.accepted);

    let forwarded = next(&mut editor).await;
    assert_eq!(forwarded.metadata.recipient, Recipient::Agent("editor".to_string()));
    assert_eq!(forwarded.payload["body"], "draft intro");
}

#[tokio::test]
async fn test_negotiation_returns_shared_capabilities() {
    let coordinator = with_agents(test_config()).await;
    let mut planner = coordinator.subscribe(RecipientFilter::agent("planner"));

    let request = message(
        Intent::CapabilityNegotiation,
        "planner",
        Recipient::Agent(COORDINATOR_ID.to_string()),
        json!({"agent_a": "planner", "agent_b": "writer", "proposed": []}),
    );
    assert!(coordinator.submit(request).await.accepted);

    let reply = next(&mut planner).await;
    assert_eq!(reply.intent, Intent::CapabilityNegotiation);
    assert_eq!(reply.payload["proposed"], json!(["summarize"]));
}

#[tokio::test]
async fn test_negotiation_without_overlap_reports_error() {
    let coordinator = with_agents(test_config()).await;
    let mut planner = coordinator.subscribe(RecipientFilter::agent("planner"));

    let request = message(
        Intent::CapabilityNegotiation,
        "planner",
        Recipient::Agent(COORDINATOR_ID.to_string()),
        json!({"agent_a": "planner", "agent_b": "editor", "proposed": []}),
    );
    assert!(coordinator.submit(request).await.accepted);

    let reply = next(&mut planner).await;
    assert_eq!(reply.intent, Intent::Error);
    assert_eq!(reply.payload["code"], json!(ErrorCode::NoCommonCapability));
}

#[tokio::test]
async fn test_direct_messages_are_rate_limited_per_sender() {
    let mut config = test_config();
    config.security.rate_limits.insert(
        "agent.message".to_string(),
        RateLimitRule {
            bucket_size: 2,
            window_secs: 60,
        },
    );
    let coordinator = with_agents(config).await;
    let mut planner = coordinator.subscribe(RecipientFilter::agent("planner"));
    let mut writer = coordinator.subscribe(RecipientFilter::agent("writer"));

    for i in 0..3 {
        coordinator
            .submit(direct("writer", "session-1", json!(i)))
            .await;
    }

    assert_eq!(next(&mut writer).await.payload["sequence"], 0);
    assert_eq!(next(&mut writer).await.payload["sequence"], 1);
    let error = next(&mut planner).await;
    assert_eq!(error.intent, Intent::Error);
    assert_eq!(error.payload["code"], json!(ErrorCode::RateLimitExceeded));
    assert!(writer.try_recv().is_none());
}

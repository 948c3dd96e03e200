//! Retry, circuit breaking and failover for tool endpoints

mod test_helpers;

use agentmesh::layers::{CircuitState, ToolInvocation};
use agentmesh::registry::CapabilityQuery;
use agentmesh::testing::mocks::{issue_test_token, MockDispatcher};
use agentmesh::{CoordError, FailureKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{start_coordinator, test_config};

const SEARCH_1: &str = "http://search-1";
const SEARCH_2: &str = "http://search-2";

fn search(token: &str) -> ToolInvocation {
    ToolInvocation::new("search.web", token, json!({"q": "circuit breakers"}))
}

#[tokio::test]
async fn test_circuit_opens_and_recovers_through_half_open_trial() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.fail(SEARCH_1, FailureKind::Transient);
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);
    let breaker = coordinator.mcp().breaker();

    let err = coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(dispatcher.calls(SEARCH_1), 2);
    assert_eq!(breaker.state(SEARCH_1), CircuitState::Open);

    let health = coordinator.health().await;
    assert!(!health.healthy);
    let circuits = health
        .components
        .iter()
        .find(|c| c.component == "circuit_breakers")
        .unwrap();
    assert!(!circuits.healthy);

    let err = coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    assert!(matches!(err, CoordError::CircuitOpen { .. }));
    assert_eq!(dispatcher.calls(SEARCH_1), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    dispatcher.respond(SEARCH_1, json!({"hits": 3}));
    let outcome = coordinator.mcp().invoke(search(&token)).await.unwrap();
    assert_eq!(outcome.result["hits"], 3);
    assert_eq!(breaker.state(SEARCH_1), CircuitState::Closed);
    assert_eq!(dispatcher.calls(SEARCH_1), 3);

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.invocations.circuit_trips, 1);
    assert_eq!(snapshot.invocations.circuit_fast_fails, 1);
}

#[tokio::test]
async fn test_failed_half_open_trial_reopens_circuit() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.fail(SEARCH_1, FailureKind::Transient);
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);

    coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The trial call fails, the circuit re-opens and the retry is refused
    let err = coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    assert!(matches!(err, CoordError::CircuitOpen { .. }));
    assert_eq!(dispatcher.calls(SEARCH_1), 3);
    assert_eq!(
        coordinator.mcp().breaker().state(SEARCH_1),
        CircuitState::Open
    );
}

#[tokio::test]
async fn test_abandoned_half_open_trial_does_not_wedge_circuit() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.fail(SEARCH_1, FailureKind::Transient);
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);
    let breaker = coordinator.mcp().breaker();

    coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    assert_eq!(breaker.state(SEARCH_1), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The trial call hangs and its caller gives up
    dispatcher.respond(SEARCH_1, json!({"hits": 1}));
    dispatcher.delay(SEARCH_1, Duration::from_secs(10));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), coordinator.mcp().invoke(search(&token)))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(breaker.state(SEARCH_1), CircuitState::HalfOpen);
    assert!(matches!(
        coordinator.mcp().invoke(search(&token)).await,
        Err(CoordError::CircuitOpen { .. })
    ));

    // One cool-down later a new trial is let through
    dispatcher.clear_delay(SEARCH_1);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let outcome = coordinator.mcp().invoke(search(&token)).await.unwrap();
    assert_eq!(outcome.result["hits"], 1);
    assert_eq!(breaker.state(SEARCH_1), CircuitState::Closed);
    assert_eq!(dispatcher.calls(SEARCH_1), 4);
}

#[tokio::test]
async fn test_transient_failure_fails_over_to_next_instance() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.fail(SEARCH_1, FailureKind::Transient);
    dispatcher.respond(SEARCH_2, json!({"hits": 9}));
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let capability = coordinator
        .registry()
        .capability(&CapabilityQuery::new("search.web"))
        .unwrap();
    coordinator
        .registry()
        .register((*capability).clone(), SEARCH_2)
        .unwrap();
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);

    let outcome = coordinator.mcp().invoke(search(&token)).await.unwrap();
    assert_eq!(outcome.endpoint, SEARCH_2);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(dispatcher.calls(SEARCH_1), 2);
    assert_eq!(dispatcher.calls(SEARCH_2), 1);
    assert_eq!(coordinator.metrics().snapshot().invocations.failovers, 1);
}

#[tokio::test]
async fn test_permanent_failure_neither_retries_nor_fails_over() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.fail(SEARCH_1, FailureKind::Permanent);
    dispatcher.respond(SEARCH_2, json!({"hits": 9}));
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let capability = coordinator
        .registry()
        .capability(&CapabilityQuery::new("search.web"))
        .unwrap();
    coordinator
        .registry()
        .register((*capability).clone(), SEARCH_2)
        .unwrap();
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);

    let err = coordinator.mcp().invoke(search(&token)).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(dispatcher.calls(SEARCH_1), 1);
    assert_eq!(dispatcher.calls(SEARCH_2), 0);
    assert_eq!(
        coordinator.mcp().breaker().state(SEARCH_1),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_repeated_idempotency_key_replays_without_dispatch() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.respond(SEARCH_1, json!({"hits": 1}));
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);

    let first = coordinator
        .mcp()
        .invoke(search(&token).with_idempotency_key("req-42"))
        .await
        .unwrap();
    let second = coordinator
        .mcp()
        .invoke(search(&token).with_idempotency_key("req-42"))
        .await
        .unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.result, first.result);
    assert_eq!(dispatcher.calls(SEARCH_1), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_dispatch_once() {
    let dispatcher = Arc::new(MockDispatcher::new());
    dispatcher.respond(SEARCH_1, json!({"hits": 5}));
    let coordinator = start_coordinator(test_config(), dispatcher.clone()).await;
    let token = issue_test_token(coordinator.security(), "researcher", &["search:read"]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mcp = coordinator.mcp().clone();
            let invocation = search(&token).with_idempotency_key("burst-1");
            tokio::spawn(async move { mcp.invoke(invocation).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let outcomes: Vec<_> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert!(outcomes.iter().all(|o| o.result == json!({"hits": 5})));
    assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);
    assert_eq!(dispatcher.calls(SEARCH_1), 1);
}

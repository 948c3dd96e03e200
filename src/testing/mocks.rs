//! Mock implementations for testing
//!
//! Provides a scripted tool dispatcher, health probe and step executor plus
//! helpers for a security framework with a fixed signing secret.

use crate::config::SecurityConfig;
use crate::error::{CoordError, CoordResult, FailureKind};
use crate::layers::{DispatchRequest, ToolDispatcher};
use crate::observability::MetricsCollector;
use crate::registry::{HealthProbe, ToolRegistry};
use crate::security::audit::{AuditLog, MemoryAuditSink};
use crate::security::SecurityFramework;
use crate::workflow::{within_step_timeout, StepExecutor, StepRequest};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_SECRET: &str = "test-signing-secret";

#[derive(Debug, Clone)]
enum Scripted {
    Respond(Value),
    Fail(FailureKind),
}

/// Dispatcher answering per endpoint from a script
#[derive(Debug, Default)]
pub struct MockDispatcher {
    script: DashMap<String, Scripted>,
    delays: DashMap<String, Duration>,
    calls: DashMap<String, usize>,
    requests: Mutex<Vec<(String, DispatchRequest)>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, endpoint: &str, result: Value) {
        self.script
            .insert(endpoint.to_string(), Scripted::Respond(result));
    }

    pub fn fail(&self, endpoint: &str, kind: FailureKind) {
        self.script.insert(endpoint.to_string(), Scripted::Fail(kind));
    }

    /// Hold every answer from `endpoint` back by `delay`
    pub fn delay(&self, endpoint: &str, delay: Duration) {
        self.delays.insert(endpoint.to_string(), delay);
    }

    pub fn clear_delay(&self, endpoint: &str) {
        self.delays.remove(endpoint);
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn requests(&self) -> Vec<(String, DispatchRequest)> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl ToolDispatcher for MockDispatcher {
    async fn dispatch(&self, endpoint: &str, request: &DispatchRequest) -> CoordResult<Value> {
        *self.calls.entry(endpoint.to_string()).or_insert(0) += 1;
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push((endpoint.to_string(), request.clone()));

        let delay = self.delays.get(endpoint).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.get(endpoint).map(|s| s.value().clone());
        match scripted {
            Some(Scripted::Respond(value)) => Ok(value),
            Some(Scripted::Fail(kind)) => Err(CoordError::tool_invocation(
                &request.tool,
                kind,
                format!("{endpoint} scripted {kind} failure"),
            )),
            None => Err(CoordError::tool_invocation(
                &request.tool,
                FailureKind::Permanent,
                format!("no response scripted for {endpoint}"),
            )),
        }
    }
}

/// Probe reporting every endpoint reachable unless marked down
#[derive(Debug, Default)]
pub struct MockProbe {
    down: DashSet<String>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, endpoint: &str) {
        self.down.insert(endpoint.to_string());
    }

    pub fn set_up(&self, endpoint: &str) {
        self.down.remove(endpoint);
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(&self, endpoint: &str) -> Result<(), String> {
        if self.down.contains(endpoint) {
            Err(format!("{endpoint} is down"))
        } else {
            Ok(())
        }
    }
}

/// Step executor that records calls and answers `{"step": <id>}`
#[derive(Debug, Default)]
pub struct MockStepExecutor {
    failures: DashMap<String, FailureKind>,
    delays: DashMap<String, Duration>,
    executed: Mutex<Vec<StepRequest>>,
}

impl MockStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, step_id: &str, kind: FailureKind) {
        self.failures.insert(step_id.to_string(), kind);
    }

    pub fn delay(&self, step_id: &str, delay: Duration) {
        self.delays.insert(step_id.to_string(), delay);
    }

    /// Step ids in the order their execution started
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .expect("mock lock poisoned")
            .iter()
            .map(|r| r.step.id.clone())
            .collect()
    }

    /// Most recent request for `step_id`
    pub fn request(&self, step_id: &str) -> Option<StepRequest> {
        self.executed
            .lock()
            .expect("mock lock poisoned")
            .iter()
            .rev()
            .find(|r| r.step.id == step_id)
            .cloned()
    }
}

#[async_trait]
impl StepExecutor for MockStepExecutor {
    async fn execute(&self, request: StepRequest) -> CoordResult<Value> {
        let step_id = request.step.id.clone();
        let timeout = request.timeout;
        self.executed
            .lock()
            .expect("mock lock poisoned")
            .push(request);

        let delay = self.delays.get(&step_id).map(|d| *d);
        if let Some(delay) = delay {
            within_step_timeout(timeout, &step_id, async {
                tokio::time::sleep(delay).await;
                Ok(Value::Null)
            })
            .await?;
        }
        let failure = self.failures.get(&step_id).map(|k| *k);
        match failure {
            Some(kind) => Err(CoordError::tool_invocation(
                &step_id,
                kind,
                format!("step {step_id} scripted to fail"),
            )),
            None => Ok(json!({ "step": step_id })),
        }
    }
}

/// Security framework with default limits, in-memory audit and `TEST_SECRET`
pub fn test_security(registry: Arc<ToolRegistry>) -> Arc<SecurityFramework> {
    Arc::new(SecurityFramework::from_config(
        &SecurityConfig::default(),
        TEST_SECRET,
        AuditLog::new(Arc::new(MemoryAuditSink::new())),
        registry,
        Arc::new(MetricsCollector::new()),
    ))
}

/// One-hour token for `subject` carrying `scopes`
pub fn issue_test_token(security: &SecurityFramework, subject: &str, scopes: &[&str]) -> String {
    security
        .tokens()
        .issue(subject, scopes, Duration::from_secs(3600))
        .expect("test token should encode")
}

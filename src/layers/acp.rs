//! Workflow orchestration layer
//!
//! Binds workflow executions to sessions and turns `workflow-control` and
//! `session-management` messages into scheduler calls. Steps run through the
//! tool layer or are delegated to agents through the peer layer.

use super::a2a::{A2aService, Delegation};
use super::mcp::{McpService, ToolInvocation};
use crate::error::{CoordError, CoordResult};
use crate::protocol::{
    validate_id, ControlAction, ProtocolMessage, Recipient, SessionAction, SessionPayload,
    WorkflowControlPayload,
};
use crate::security::{action, SecurityFramework};
use crate::workflow::{
    ExecutionStatus, StepExecutor, StepRequest, StepState, StepTarget, WorkflowDefinition,
    WorkflowExecution, WorkflowScheduler,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Scope needed to start a workflow
pub const RUN_SCOPE: &str = "workflow:run";
/// Scope needed to pause, resume or cancel one
pub const CONTROL_SCOPE: &str = "workflow:control";

/// Tokens of the callers that started each session's workflow
pub type SessionCredentials = Arc<DashMap<String, String>>;

/// Wire view of an execution
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub session_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub steps: BTreeMap<String, StepState>,
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowExecution> for ExecutionSummary {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.execution_id,
            session_id: execution.session_id.clone(),
            workflow_id: execution.workflow_id().to_string(),
            status: execution.status,
            steps: execution
                .steps
                .iter()
                .map(|(id, record)| (id.clone(), record.state))
                .collect(),
            outputs: execution.outputs(),
            error: execution.error.clone(),
            updated_at: execution.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AcpSession {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

pub struct AcpService {
    scheduler: WorkflowScheduler,
    security: Arc<SecurityFramework>,
    a2a: Arc<A2aService>,
    definitions: DashMap<String, WorkflowDefinition>,
    sessions: DashMap<String, AcpSession>,
    credentials: SessionCredentials,
}

impl std::fmt::Debug for AcpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpService")
            .field("definitions", &self.definitions.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl AcpService {
    pub fn new(
        scheduler: WorkflowScheduler,
        security: Arc<SecurityFramework>,
        a2a: Arc<A2aService>,
        credentials: SessionCredentials,
    ) -> Self {
        Self {
            scheduler,
            security,
            a2a,
            definitions: DashMap::new(),
            sessions: DashMap::new(),
            credentials,
        }
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        &self.scheduler
    }

    /// Register a definition after checking it is acyclic.
    /// Returns the step order.
    pub fn define(&self, definition: WorkflowDefinition) -> CoordResult<Vec<String>> {
        let order = definition.validate()?;
        info!(workflow_id = %definition.id, steps = order.len(), "Workflow defined");
        self.definitions.insert(definition.id.clone(), definition);
        Ok(order)
    }

    pub fn definition(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions.get(workflow_id).map(|d| d.clone())
    }

    /// Authorize the caller and start a defined workflow in `session_id`
    pub async fn execute(
        &self,
        workflow_id: &str,
        session_id: &str,
        input: Value,
        auth_token: &str,
    ) -> CoordResult<ExecutionSummary> {
        let definition =
            self.definition(workflow_id)
                .ok_or_else(|| CoordError::UnknownWorkflow {
                    workflow_id: workflow_id.to_string(),
                })?;
        self.security
            .authorize(
                auth_token,
                &[RUN_SCOPE.to_string()],
                &format!("workflow:{workflow_id}"),
            )
            .await?;

        self.ensure_session(session_id, None)?;
        self.credentials
            .insert(session_id.to_string(), auth_token.to_string());

        match self.scheduler.submit(definition, session_id, input).await {
            Ok(execution) => Ok(ExecutionSummary::from(&execution)),
            Err(e) => {
                self.credentials.remove(session_id);
                Err(e)
            }
        }
    }

    pub fn status(&self, session_id: &str) -> CoordResult<ExecutionSummary> {
        self.scheduler
            .status(session_id)
            .map(|execution| ExecutionSummary::from(&execution))
    }

    /// Handle a `workflow-control` message addressed to a session
    pub async fn control(&self, message: &ProtocolMessage) -> CoordResult<Value> {
        let session_id = session_of(message)?;
        let payload: WorkflowControlPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| CoordError::schema(format!("workflow-control payload: {e}")))?;
        self.security
            .enforce_rate_limit(&message.metadata.sender, action::WORKFLOW_CONTROL)
            .await?;

        let token = payload.auth_token.as_deref().unwrap_or_default();
        debug!(session_id, action = ?payload.action, "Workflow control");

        let summary = match payload.action {
            ControlAction::Start => {
                let workflow_id = match (payload.definition, payload.workflow_id) {
                    (Some(definition), _) => {
                        let definition = WorkflowDefinition::from_value(definition)?;
                        let workflow_id = definition.id.clone();
                        self.define(definition)?;
                        workflow_id
                    }
                    (None, Some(workflow_id)) => workflow_id,
                    (None, None) => {
                        return Err(CoordError::invalid_input(
                            "start needs a workflow_id or an inline definition",
                        ))
                    }
                };
                self.execute(&workflow_id, session_id, payload.input, token)
                    .await?
            }
            ControlAction::Status => self.status(session_id)?,
            action => {
                self.security
                    .authorize(
                        token,
                        &[CONTROL_SCOPE.to_string()],
                        &format!("session:{session_id}"),
                    )
                    .await?;
                match action {
                    ControlAction::Pause => self.scheduler.pause(session_id)?,
                    ControlAction::Resume => self.scheduler.resume(session_id)?,
                    _ => self.scheduler.cancel(session_id)?,
                }
                self.status(session_id)?
            }
        };

        serde_json::to_value(summary)
            .map_err(|e| CoordError::internal(format!("execution summary: {e}")))
    }

    /// Handle a `session-management` message
    pub async fn session(&self, message: &ProtocolMessage) -> CoordResult<Value> {
        let session_id = session_of(message)?;
        let payload: SessionPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| CoordError::schema(format!("session-management payload: {e}")))?;

        match payload.action {
            SessionAction::Open => {
                let session = self.ensure_session(session_id, payload.context_id)?;
                to_json(&session)
            }
            SessionAction::Close => {
                self.close_session(session_id)?;
                Ok(json!({"session_id": session_id, "closed": true}))
            }
            SessionAction::Status => {
                let session = self
                    .sessions
                    .get(session_id)
                    .map(|s| s.clone())
                    .ok_or_else(|| CoordError::unknown_session(session_id))?;
                let workflow = self.status(session_id).ok();
                Ok(json!({"session": session, "workflow": workflow}))
            }
        }
    }

    fn ensure_session(
        &self,
        session_id: &str,
        context_id: Option<String>,
    ) -> CoordResult<AcpSession> {
        validate_id(session_id)
            .map_err(|e| CoordError::invalid_input(format!("session id: {e}")))?;
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, "Session opened");
                AcpSession {
                    session_id: session_id.to_string(),
                    context_id: context_id.clone(),
                    opened_at: Utc::now(),
                }
            })
            .clone();
        Ok(session)
    }

    /// Close a session whose workflow, if any, has finished
    pub fn close_session(&self, session_id: &str) -> CoordResult<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(CoordError::unknown_session(session_id));
        }
        if let Ok(execution) = self.scheduler.status(session_id) {
            if !self.scheduler.release(session_id) {
                return Err(CoordError::invalid_input(format!(
                    "session '{session_id}' still runs workflow '{}' ({})",
                    execution.workflow_id(),
                    execution.status
                )));
            }
        }
        self.sessions.remove(session_id);
        self.credentials.remove(session_id);
        self.a2a.close_session(session_id);
        info!(session_id, "Session closed");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn session_of(message: &ProtocolMessage) -> CoordResult<&str> {
    match &message.metadata.recipient {
        Recipient::Session(session_id) => Ok(session_id),
        other => Err(CoordError::invalid_input(format!(
            "{} must address a session, not {other}",
            message.intent
        ))),
    }
}

fn to_json<T: Serialize>(value: &T) -> CoordResult<Value> {
    serde_json::to_value(value).map_err(|e| CoordError::internal(format!("encoding: {e}")))
}

/// Runs tool steps through the tool layer and agent steps by delegation
pub struct LayerStepExecutor {
    mcp: Arc<McpService>,
    a2a: Arc<A2aService>,
    credentials: SessionCredentials,
    /// Used when the starting caller's token is gone, e.g. after a restart
    service_token: Option<String>,
}

impl LayerStepExecutor {
    pub fn new(
        mcp: Arc<McpService>,
        a2a: Arc<A2aService>,
        credentials: SessionCredentials,
        service_token: Option<String>,
    ) -> Self {
        Self {
            mcp,
            a2a,
            credentials,
            service_token,
        }
    }

    fn token_for(&self, session_id: &str) -> CoordResult<String> {
        self.credentials
            .get(session_id)
            .map(|token| token.clone())
            .or_else(|| self.service_token.clone())
            .ok_or_else(|| {
                CoordError::authentication(format!("no credentials for session '{session_id}'"))
            })
    }
}

#[async_trait]
impl StepExecutor for LayerStepExecutor {
    async fn execute(&self, request: StepRequest) -> CoordResult<Value> {
        match &request.step.target {
            StepTarget::Tool { name, version } => {
                let mut invocation = ToolInvocation::new(
                    name,
                    self.token_for(&request.session_id)?,
                    request.input.clone(),
                )
                // Stable across retries and recovery of the same execution
                .with_idempotency_key(format!(
                    "{}:{}",
                    request.execution_id, request.step.id
                ))
                .with_dispatch_deadline(request.timeout);
                if let Some(version) = version {
                    invocation = invocation.with_version(version);
                }
                let outcome = self.mcp.invoke(invocation).await?;
                Ok(outcome.result)
            }
            StepTarget::Agent { capability } => {
                self.a2a
                    .delegate(Delegation {
                        session_id: request.session_id.clone(),
                        step_id: request.step.id.clone(),
                        capability: capability.clone(),
                        instruction: request.step.instruction.clone(),
                        input: json!({
                            "input": request.input,
                            "context": request.context,
                        }),
                        // Leaves room for one failover inside the step timeout
                        attempt_timeout: Some(request.timeout / 2),
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsCollector;
    use crate::protocol::Intent;
    use crate::registry::{AgentDirectory, ToolRegistry};
    use crate::testing::mocks::{issue_test_token, test_security, MockStepExecutor};
    use crate::transport::LocalBus;
    use crate::workflow::{MemoryCheckpointStore, SchedulerSettings, WorkflowStep};
    use std::time::Duration;

    struct Fixture {
        acp: AcpService,
        executor: Arc<MockStepExecutor>,
        security: Arc<SecurityFramework>,
    }

    fn fixture() -> Fixture {
        let security = test_security(Arc::new(ToolRegistry::new()));
        let executor = Arc::new(MockStepExecutor::new());
        let scheduler = WorkflowScheduler::new(
            executor.clone(),
            Arc::new(MemoryCheckpointStore::default()),
            Arc::new(MetricsCollector::new()),
            SchedulerSettings::default(),
        );
        let a2a = Arc::new(A2aService::new(
            "agentmesh",
            Arc::new(AgentDirectory::new(Duration::from_secs(15), 3)),
            Arc::clone(&security),
            LocalBus::new(16),
            Duration::from_secs(1),
        ));
        Fixture {
            acp: AcpService::new(scheduler, Arc::clone(&security), a2a, Arc::default()),
            executor,
            security,
        }
    }

    fn control(session: &str, payload: Value) -> ProtocolMessage {
        ProtocolMessage::new(
            Intent::WorkflowControl,
            "planner",
            Recipient::Session(session.to_string()),
            payload,
        )
    }

    #[tokio::test]
    async fn test_start_inline_definition_and_status() {
        let f = fixture();
        let token = issue_test_token(&f.security, "planner", &[RUN_SCOPE]);
        let started = f
            .acp
            .control(&control(
                "s1",
                json!({
                    "action": "start",
                    "auth_token": token,
                    "definition": {"id": "report", "steps": [
                        {"id": "collect", "target": {"kind": "agent", "capability": "research"}}
                    ]}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(started["workflow_id"], "report");

        f.acp
            .scheduler()
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        let status = f
            .acp
            .control(&control("s1", json!({"action": "status"})))
            .await
            .unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(f.executor.executed(), vec!["collect"]);
    }

    #[tokio::test]
    async fn test_start_requires_run_scope() {
        let f = fixture();
        f.acp
            .define(WorkflowDefinition::new(
                "report",
                vec![WorkflowStep::agent("collect", "research")],
            ))
            .unwrap();
        let token = issue_test_token(&f.security, "planner", &[CONTROL_SCOPE]);
        let result = f.acp.execute("report", "s1", json!({}), &token).await;
        assert!(matches!(result, Err(CoordError::Authorization { .. })));
        assert!(f.acp.status("s1").is_err());
    }

    #[tokio::test]
    async fn test_control_routes_to_bound_session() {
        let f = fixture();
        f.executor.delay("slow", Duration::from_millis(200));
        f.acp
            .define(WorkflowDefinition::new(
                "long",
                vec![
                    WorkflowStep::agent("slow", "x"),
                    WorkflowStep::agent("after", "x").after(["slow"]),
                ],
            ))
            .unwrap();
        let token = issue_test_token(&f.security, "planner", &[RUN_SCOPE, CONTROL_SCOPE]);
        f.acp.execute("long", "s1", json!({}), &token).await.unwrap();
        f.acp.execute("long", "s2", json!({}), &token).await.unwrap();

        f.acp
            .control(&control("s1", json!({"action": "cancel", "auth_token": token})))
            .await
            .unwrap();
        let s1 = f
            .acp
            .scheduler()
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        let s2 = f
            .acp
            .scheduler()
            .wait_for_completion("s2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(s1.status, ExecutionStatus::Cancelled);
        assert_eq!(s2.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_session_close_rejected_while_running() {
        let f = fixture();
        f.executor.delay("slow", Duration::from_millis(100));
        f.acp
            .define(WorkflowDefinition::new("w", vec![WorkflowStep::agent("slow", "x")]))
            .unwrap();
        let token = issue_test_token(&f.security, "planner", &[RUN_SCOPE]);
        f.acp.execute("w", "s1", json!({}), &token).await.unwrap();

        assert!(f.acp.close_session("s1").is_err());
        f.acp
            .scheduler()
            .wait_for_completion("s1", Duration::from_secs(5))
            .await
            .unwrap();
        f.acp.close_session("s1").unwrap();
        assert_eq!(f.acp.session_count(), 0);
        assert!(matches!(
            f.acp.close_session("s1"),
            Err(CoordError::UnknownSession { .. })
        ));
    }
}

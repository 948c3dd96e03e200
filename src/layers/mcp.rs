//! Tool integration layer
//!
//! An invocation passes through, in order: capability lookup, authorization,
//! rate limiting, input schema validation, the idempotency cache, the approval
//! gate for risky tools, and dispatch to the best ranked instance with retries,
//! a circuit breaker per endpoint and one failover to the next instance.

use super::circuit_breaker::CircuitBreaker;
use super::dispatcher::{DispatchRequest, RetryPolicy, ToolDispatcher};
use crate::config::{CircuitBreakerConfig, DispatchConfig};
use crate::error::{CoordError, CoordResult, FailureKind};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::schema::compile_schema;
use crate::protocol::ToolRequestPayload;
use crate::registry::{CapabilityQuery, ToolCapability, ToolEndpoint, ToolRegistry};
use crate::security::{action, AuditOutcome, InvocationRef, SecurityFramework};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// A request to run one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub version: Option<String>,
    pub arguments: Value,
    pub auth_token: String,
    /// Invocations sharing a key (per actor) execute at most once
    pub idempotency_key: String,
    /// Bound on dispatch including retries and failover. Time spent waiting
    /// for an approval is not counted.
    pub dispatch_deadline: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, auth_token: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            version: None,
            arguments,
            auth_token: auth_token.into(),
            idempotency_key: Uuid::new_v4().to_string(),
            dispatch_deadline: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_dispatch_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = Some(deadline);
        self
    }

    /// Build from a `tool-request` payload; the message id is the fallback key
    pub fn from_request(payload: ToolRequestPayload, message_id: Uuid) -> Self {
        Self {
            tool: payload.tool,
            version: payload.version,
            arguments: payload.arguments,
            auth_token: payload.auth_token,
            idempotency_key: payload
                .idempotency_key
                .unwrap_or_else(|| message_id.to_string()),
            dispatch_deadline: None,
        }
    }
}

/// Result of a completed invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    pub tool: String,
    pub version: String,
    pub endpoint: String,
    pub result: Value,
    pub actor: String,
    /// Dispatch attempts across all endpoints tried
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Served from the idempotency cache
    pub replayed: bool,
}

#[derive(Debug, Clone)]
struct CompletedInvocation {
    outcome: InvocationOutcome,
    at: Instant,
}

type IdempotencySlot = Arc<Mutex<Option<CompletedInvocation>>>;

pub struct McpService {
    registry: Arc<ToolRegistry>,
    security: Arc<SecurityFramework>,
    dispatcher: Arc<dyn ToolDispatcher>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    idempotency_retention: Duration,
    metrics: Arc<MetricsCollector>,
    completed: DashMap<String, IdempotencySlot>,
    input_validators: DashMap<(String, String), Arc<jsonschema::Validator>>,
}

impl std::fmt::Debug for McpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpService")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl McpService {
    pub fn new(
        registry: Arc<ToolRegistry>,
        security: Arc<SecurityFramework>,
        dispatcher: Arc<dyn ToolDispatcher>,
        dispatch: &DispatchConfig,
        breaker: &CircuitBreakerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            security,
            dispatcher,
            breaker: CircuitBreaker::from_config(breaker),
            retry: RetryPolicy::from_config(dispatch),
            timeout: dispatch.timeout(),
            idempotency_retention: dispatch.idempotency_retention(),
            metrics,
            completed: DashMap::new(),
            input_validators: DashMap::new(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Idempotency keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.completed.len()
    }

    /// Forget completed invocations past their retention and the empty slots
    /// left by failed ones. Keys still in use are kept.
    pub fn prune_completed(&self) -> usize {
        self.prune_completed_at(Instant::now())
    }

    pub fn prune_completed_at(&self, now: Instant) -> usize {
        let before = self.completed.len();
        self.completed.retain(|_, slot| {
            // Someone besides the map still holds the slot
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.as_ref().is_some_and(|done| {
                    now.saturating_duration_since(done.at) < self.idempotency_retention
                }),
                Err(_) => true,
            }
        });
        let pruned = before.saturating_sub(self.completed.len());
        if pruned > 0 {
            debug!(pruned, "Pruned idempotency cache");
        }
        pruned
    }

    /// Run a tool invocation through the full security and dispatch pipeline
    pub async fn invoke(&self, invocation: ToolInvocation) -> CoordResult<InvocationOutcome> {
        let mut query = CapabilityQuery::new(&invocation.tool);
        if let Some(version) = &invocation.version {
            query = query.with_version(version);
        }
        let capability = self
            .registry
            .capability(&query)
            .ok_or_else(|| CoordError::no_available_instance(&invocation.tool))?;

        let claims = self
            .security
            .authorize(
                &invocation.auth_token,
                &capability.required_scopes,
                &capability.name,
            )
            .await?;
        let actor = claims.sub;

        let span = crate::invocation_span!(capability.name, capability.version, actor);
        self.invoke_authorized(invocation, capability, actor)
            .instrument(span)
            .await
    }

    async fn invoke_authorized(
        &self,
        invocation: ToolInvocation,
        capability: Arc<ToolCapability>,
        actor: String,
    ) -> CoordResult<InvocationOutcome> {
        self.security
            .enforce_rate_limit(&actor, action::TOOL_INVOKE)
            .await?;
        self.validate_arguments(&capability, &invocation.arguments)?;

        let slot = self
            .completed
            .entry(format!("{actor}:{}", invocation.idempotency_key))
            .or_default()
            .clone();
        let mut cached = slot.lock().await;
        if let Some(done) = cached.as_ref() {
            self.metrics.idempotent_replay();
            debug!(key = %invocation.idempotency_key, "Replaying completed invocation");
            return Ok(InvocationOutcome {
                replayed: true,
                ..done.outcome.clone()
            });
        }

        let pinned = CapabilityQuery::new(&capability.name).with_version(&capability.version);
        let risk = self.security.classify_risk(&pinned)?;
        let approval_id = if risk.requires_approval() {
            let approval = self
                .security
                .request_approval(
                    InvocationRef {
                        tool: capability.name.clone(),
                        version: capability.version.clone(),
                        idempotency_key: invocation.idempotency_key.clone(),
                        arguments: invocation.arguments.clone(),
                    },
                    risk,
                    &actor,
                )
                .await?;
            Some(approval.id)
        } else {
            None
        };

        let request = DispatchRequest {
            tool: capability.name.clone(),
            version: capability.version.clone(),
            arguments: invocation.arguments,
            idempotency_key: invocation.idempotency_key,
        };

        self.metrics.invocation_started();
        let started = Instant::now();
        let result = match invocation.dispatch_deadline {
            Some(deadline) => tokio::time::timeout(
                deadline,
                self.dispatch_with_failover(&pinned, &request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CoordError::tool_invocation(
                    &request.tool,
                    FailureKind::Transient,
                    format!("dispatch exceeded {}ms", deadline.as_millis()),
                ))
            }),
            None => self.dispatch_with_failover(&pinned, &request).await,
        };
        self.metrics
            .invocation_finished(&capability.name, started.elapsed(), result.is_ok());

        let target = format!("{}@{}", capability.name, capability.version);
        match result {
            Ok((endpoint, value, attempts)) => {
                self.security
                    .audit(
                        &actor,
                        "tool.invoke",
                        &target,
                        AuditOutcome::Succeeded,
                        Some(endpoint.clone()),
                    )
                    .await;
                info!(endpoint = %endpoint, attempts, "Tool invocation succeeded");

                let outcome = InvocationOutcome {
                    tool: capability.name.clone(),
                    version: capability.version.clone(),
                    endpoint,
                    result: value,
                    actor,
                    attempts,
                    approval_id,
                    replayed: false,
                };
                *cached = Some(CompletedInvocation {
                    outcome: outcome.clone(),
                    at: Instant::now(),
                });
                Ok(outcome)
            }
            Err(e) => {
                self.security
                    .audit(
                        &actor,
                        "tool.invoke",
                        &target,
                        AuditOutcome::Failed,
                        Some(e.to_string()),
                    )
                    .await;
                warn!(error = %e, "Tool invocation failed");
                Err(e)
            }
        }
    }

    fn validate_arguments(&self, capability: &ToolCapability, arguments: &Value) -> CoordResult<()> {
        let Some(schema) = &capability.input_schema else {
            return Ok(());
        };

        let key = (capability.name.clone(), capability.version.clone());
        let validator = match self.input_validators.get(&key) {
            Some(validator) => Arc::clone(validator.value()),
            None => {
                let validator = Arc::new(compile_schema(schema)?);
                self.input_validators.insert(key, Arc::clone(&validator));
                validator
            }
        };

        validator.validate(arguments).map_err(|errors| {
            let messages: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            CoordError::schema(format!(
                "arguments for {}: {}",
                capability.name,
                messages.join("; ")
            ))
        })
    }

    /// Try the best instance, then fail over once to the next ranked one
    async fn dispatch_with_failover(
        &self,
        query: &CapabilityQuery,
        request: &DispatchRequest,
    ) -> CoordResult<(String, Value, u32)> {
        let candidates = self.registry.candidates(query);
        if candidates.is_empty() {
            return Err(CoordError::no_available_instance(&query.name));
        }

        let mut total_attempts = 0;
        let mut last_error = None;
        for (index, endpoint) in candidates.iter().take(2).enumerate() {
            if index > 0 {
                self.metrics.failover();
                warn!(endpoint = %endpoint.endpoint, "Failing over to next ranked instance");
            }

            let (result, attempts) = self.call_endpoint(endpoint, request).await;
            total_attempts += attempts;
            match result {
                Ok(value) => return Ok((endpoint.endpoint.clone(), value, total_attempts)),
                Err(e) if !fails_over(&e) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| CoordError::no_available_instance(&query.name)))
    }

    /// Dispatch to one endpoint with bounded retries for transient failures
    async fn call_endpoint(
        &self,
        endpoint: &ToolEndpoint,
        request: &DispatchRequest,
    ) -> (CoordResult<Value>, u32) {
        let url = endpoint.endpoint.as_str();
        let mut attempts = 0;

        loop {
            if let Err(e) = self.breaker.try_acquire(url) {
                self.metrics.circuit_fast_failed();
                return (Err(e), attempts);
            }

            attempts += 1;
            let result = {
                let _load = endpoint.begin_invocation();
                tokio::time::timeout(self.timeout, self.dispatcher.dispatch(url, request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(CoordError::tool_invocation(
                            &request.tool,
                            FailureKind::Transient,
                            format!("timed out after {}ms", self.timeout.as_millis()),
                        ))
                    })
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success(url);
                    return (Ok(value), attempts);
                }
                Err(e) if e.is_retryable() => {
                    if self.breaker.record_failure(url) {
                        self.metrics.circuit_tripped();
                    }
                    if attempts >= self.retry.max_attempts {
                        return (Err(e), attempts);
                    }
                    let delay = self.retry.backoff(attempts);
                    debug!(endpoint = url, attempts, ?delay, error = %e, "Retrying tool dispatch");
                    self.metrics.dispatch_retried();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // The endpoint answered, so it counts as reachable
                    self.breaker.record_success(url);
                    return (Err(e), attempts);
                }
            }
        }
    }
}

/// Failures worth trying on another instance
fn fails_over(error: &CoordError) -> bool {
    error.is_retryable() || matches!(error, CoordError::CircuitOpen { .. })
}

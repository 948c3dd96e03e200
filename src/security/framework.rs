//! Security facade used by the layer services
//!
//! Wraps token validation, risk lookup, the approval queue, rate limiting and
//! the audit log so every decision is audited in one place.

use super::approval::{ApprovalQueue, ApprovalRequest, ApprovalSweep, InvocationRef};
use super::audit::{AuditLog, AuditOutcome};
use super::auth::{Claims, TokenValidator};
use super::rate_limit::{RateDecision, RateLimiter};
use crate::config::SecurityConfig;
use crate::error::{CoordError, CoordResult};
use crate::observability::metrics::MetricsCollector;
use crate::registry::{CapabilityQuery, RiskLevel, ToolRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Actor recorded when a token cannot be decoded
const UNKNOWN_ACTOR: &str = "anonymous";

pub struct SecurityFramework {
    tokens: TokenValidator,
    approvals: Arc<ApprovalQueue>,
    limiter: RateLimiter,
    audit: AuditLog,
    registry: Arc<ToolRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for SecurityFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityFramework")
            .field("approvals", &self.approvals)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl SecurityFramework {
    pub fn new(
        tokens: TokenValidator,
        approvals: Arc<ApprovalQueue>,
        limiter: RateLimiter,
        audit: AuditLog,
        registry: Arc<ToolRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            tokens,
            approvals,
            limiter,
            audit,
            registry,
            metrics,
        }
    }

    /// Build from configuration with an already resolved signing secret
    pub fn from_config(
        config: &SecurityConfig,
        secret: &str,
        audit: AuditLog,
        registry: Arc<ToolRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::new(
            TokenValidator::new(secret),
            Arc::new(ApprovalQueue::new(config.approval_expiry())),
            RateLimiter::new(config.default_rule(), config.rate_limits.clone()),
            audit,
            registry,
            metrics,
        )
    }

    pub fn tokens(&self) -> &TokenValidator {
        &self.tokens
    }

    pub fn approvals(&self) -> &Arc<ApprovalQueue> {
        &self.approvals
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Forget decided approvals past their retention and refilled rate buckets
    pub fn prune(&self) -> (ApprovalSweep, usize) {
        let sweep = self.approvals.sweep();
        let buckets = self.limiter.prune();
        if sweep.evicted > 0 || buckets > 0 {
            debug!(
                approvals_expired = sweep.expired,
                approvals_evicted = sweep.evicted,
                buckets,
                "Pruned security state"
            );
        }
        (sweep, buckets)
    }

    /// Validate `token` and check it grants `required_scopes` for `target`
    pub async fn authorize(
        &self,
        token: &str,
        required_scopes: &[String],
        target: &str,
    ) -> CoordResult<Claims> {
        match self.tokens.authorize(token, required_scopes) {
            Ok(claims) => {
                self.audit
                    .record(&claims.sub, "authorize", target, AuditOutcome::Allowed, None)
                    .await;
                Ok(claims)
            }
            Err(e) => {
                self.metrics.auth_failed();
                let actor = match &e {
                    CoordError::Authorization { actor, .. } => actor.clone(),
                    _ => UNKNOWN_ACTOR.to_string(),
                };
                warn!(actor = %actor, target, error = %e, "Authorization denied");
                self.audit
                    .record(
                        &actor,
                        "authorize",
                        target,
                        AuditOutcome::Denied,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Risk level fixed at registration time
    pub fn classify_risk(&self, query: &CapabilityQuery) -> CoordResult<RiskLevel> {
        self.registry
            .capability(query)
            .map(|capability| capability.risk)
            .ok_or_else(|| CoordError::no_available_instance(&query.name))
    }

    /// Block until a human decides, then spend the approval
    pub async fn request_approval(
        &self,
        invocation: InvocationRef,
        risk: RiskLevel,
        requested_by: &str,
    ) -> CoordResult<ApprovalRequest> {
        let target = invocation.tool.clone();
        self.metrics.approval_requested();

        let result = self
            .approvals
            .request_approval(invocation, risk, requested_by)
            .await;

        let (outcome, detail) = match &result {
            Ok(request) => {
                self.metrics.approval_granted();
                (AuditOutcome::Approved, request.decided_by.clone())
            }
            Err(CoordError::ApprovalRejected { approval_id }) => {
                self.metrics.approval_rejected();
                (AuditOutcome::Rejected, Some(approval_id.to_string()))
            }
            Err(CoordError::ApprovalTimeout { approval_id, .. }) => {
                self.metrics.approval_expired();
                (AuditOutcome::Expired, Some(approval_id.to_string()))
            }
            Err(e) => (AuditOutcome::Failed, Some(e.to_string())),
        };
        self.audit
            .record(requested_by, "approval", &target, outcome, detail)
            .await;
        result
    }

    /// Take a rate-limit token for `actor` on `action`
    pub async fn rate_limit(&self, actor: &str, action: &str) -> RateDecision {
        let decision = self.limiter.check(actor, action);
        match decision {
            RateDecision::Allowed { remaining } => {
                debug!(actor, action, remaining, "Rate limit allowed");
                self.audit
                    .record(actor, "rate_limit", action, AuditOutcome::Allowed, None)
                    .await;
            }
            RateDecision::Denied { retry_after } => {
                self.metrics.rate_limit_denied();
                self.audit
                    .record(
                        actor,
                        "rate_limit",
                        action,
                        AuditOutcome::Denied,
                        Some(format!("retry after {}ms", retry_after.as_millis())),
                    )
                    .await;
            }
        }
        decision
    }

    /// Like [`rate_limit`](Self::rate_limit) but a denial is an error
    pub async fn enforce_rate_limit(&self, actor: &str, action: &str) -> CoordResult<()> {
        match self.rate_limit(actor, action).await {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after } => Err(CoordError::RateLimitExceeded {
                actor: actor.to_string(),
                action: action.to_string(),
                retry_after,
            }),
        }
    }

    /// Record an operation outcome. Never fails.
    pub async fn audit(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) {
        self.audit.record(actor, action, target, outcome, detail).await;
    }
}

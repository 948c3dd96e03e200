//! Health checks for coordinator components
//!
//! Each component check reports healthy or not with a short message. The
//! coordinator combines them with agent, tool, session and router counts
//! into one `HealthStatus`, served over HTTP and answered to `health-check`
//! messages.

use crate::layers::{AcpService, McpService};
use crate::registry::{AgentDirectory, ToolRegistry};
use crate::routing::{MessageRouter, RouterStats};
use crate::workflow::WorkflowScheduler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Health check result
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl HealthCheckResult {
    fn timed(component: &str, started: Instant, healthy: bool, message: String) -> Self {
        Self {
            component: component.to_string(),
            healthy,
            message: Some(message),
            response_time_ms: Some(started.elapsed().as_millis() as u64),
        }
    }
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> HealthCheckResult;

    fn component_name(&self) -> &str;
}

/// Unhealthy when a registered tool has no selectable instance
pub struct ToolRegistryHealthCheck {
    registry: Arc<ToolRegistry>,
}

impl ToolRegistryHealthCheck {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealthCheck for ToolRegistryHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let statuses = self.registry.statuses();

        let registered: BTreeSet<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        let available: BTreeSet<&str> = statuses
            .iter()
            .filter(|s| s.liveness.is_selectable())
            .map(|s| s.name.as_str())
            .collect();
        let unavailable: Vec<&str> = registered.difference(&available).copied().collect();

        let healthy = unavailable.is_empty();
        let message = if healthy {
            format!("{} tools available", registered.len())
        } else {
            format!("no available instance for: {}", unavailable.join(", "))
        };
        debug!(healthy, tools = registered.len(), "Tool registry health check");
        HealthCheckResult::timed(self.component_name(), started, healthy, message)
    }

    fn component_name(&self) -> &str {
        "tool_registry"
    }
}

/// Unhealthy when agents are registered but none can be selected
pub struct AgentDirectoryHealthCheck {
    agents: Arc<AgentDirectory>,
}

impl AgentDirectoryHealthCheck {
    pub fn new(agents: Arc<AgentDirectory>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl HealthCheck for AgentDirectoryHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let profiles = self.agents.all();
        let selectable = profiles
            .iter()
            .filter(|p| p.liveness.is_selectable())
            .count();

        let healthy = profiles.is_empty() || selectable > 0;
        let message = format!("{selectable}/{} agents selectable", profiles.len());
        HealthCheckResult::timed(self.component_name(), started, healthy, message)
    }

    fn component_name(&self) -> &str {
        "agent_directory"
    }
}

/// Unhealthy when in-flight messages reach the router's capacity
pub struct RouterHealthCheck {
    router: MessageRouter,
    capacity: usize,
}

impl RouterHealthCheck {
    pub fn new(router: MessageRouter, capacity: usize) -> Self {
        Self { router, capacity }
    }
}

#[async_trait]
impl HealthCheck for RouterHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let stats = self.router.stats();
        let in_flight = stats.queued + stats.routed;

        let healthy = in_flight < self.capacity;
        let message = format!(
            "{in_flight}/{} in flight, {} delivered, {} failed",
            self.capacity, stats.delivered, stats.failed
        );
        HealthCheckResult::timed(self.component_name(), started, healthy, message)
    }

    fn component_name(&self) -> &str {
        "message_router"
    }
}

/// Unhealthy while any tool endpoint's circuit is open
pub struct CircuitHealthCheck {
    mcp: Arc<McpService>,
}

impl CircuitHealthCheck {
    pub fn new(mcp: Arc<McpService>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl HealthCheck for CircuitHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let open = self.mcp.breaker().open_endpoints();
        let healthy = open.is_empty();
        let message = if healthy {
            "all circuits closed".to_string()
        } else {
            format!("open circuits: {}", open.join(", "))
        };
        HealthCheckResult::timed(self.component_name(), started, healthy, message)
    }

    fn component_name(&self) -> &str {
        "circuit_breakers"
    }
}

/// Aggregated health check manager
#[derive(Default)]
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// All components must be healthy for overall health
    pub fn calculate_overall_health(results: &[HealthCheckResult]) -> bool {
        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return true;
        }
        let healthy_count = results.iter().filter(|r| r.healthy).count();
        debug!(
            "Overall health check: {}/{} components healthy",
            healthy_count,
            results.len()
        );
        healthy_count == results.len()
    }
}

/// Coordinator-wide health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub agents_registered: usize,
    pub agents_online: usize,
    pub tool_instances: usize,
    pub tools_online: usize,
    pub sessions: usize,
    pub active_workflows: usize,
    pub router: RouterStats,
    pub components: Vec<HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn health(&self) -> HealthStatus;
}

pub struct CoordinatorHealth {
    manager: HealthCheckManager,
    agents: Arc<AgentDirectory>,
    registry: Arc<ToolRegistry>,
    scheduler: WorkflowScheduler,
    acp: Arc<AcpService>,
    router: MessageRouter,
}

impl CoordinatorHealth {
    pub fn new(
        manager: HealthCheckManager,
        agents: Arc<AgentDirectory>,
        registry: Arc<ToolRegistry>,
        acp: Arc<AcpService>,
        router: MessageRouter,
    ) -> Self {
        Self {
            manager,
            agents,
            registry,
            scheduler: acp.scheduler().clone(),
            acp,
            router,
        }
    }
}

#[async_trait]
impl HealthSource for CoordinatorHealth {
    async fn health(&self) -> HealthStatus {
        let components = self.manager.run_health_checks().await;
        HealthStatus {
            healthy: HealthCheckManager::calculate_overall_health(&components),
            agents_registered: self.agents.agent_count(),
            agents_online: self.agents.online_count(),
            tool_instances: self.registry.instance_count(),
            tools_online: self.registry.online_count(),
            sessions: self.acp.session_count(),
            active_workflows: self.scheduler.active_sessions(),
            router: self.router.stats(),
            components,
            timestamp: Utc::now(),
        }
    }
}

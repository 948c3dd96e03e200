//! Coordinator assembly and lifecycle
//!
//! Builds every component from one `CoordinatorConfig`, wires the layer
//! handlers into the router, and owns the background tasks: health polling,
//! periodic pruning of router, idempotency and security state, the health
//! HTTP server and startup recovery.

use crate::config::CoordinatorConfig;
use crate::error::{CoordError, CoordResult};
use crate::health::{
    AgentDirectoryHealthCheck, CircuitHealthCheck, CoordinatorHealth, HealthCheckManager,
    HealthSource, HealthStatus, RouterHealthCheck, ToolRegistryHealthCheck,
};
use crate::layers::{
    A2aHandler, A2aService, AcpHandler, AcpService, HealthSlot, HttpDispatcher,
    InfrastructureHandler, LayerStepExecutor, McpHandler, McpService, SessionCredentials,
    ToolDispatcher,
};
use crate::observability::{HealthServer, MetricsCollector};
use crate::registry::{AgentDirectory, HealthPoller, HealthProbe, HttpHealthProbe, ToolRegistry};
use crate::routing::{DispatchTable, MessageRouter};
use crate::security::{AuditLog, JsonlAuditSink, MemoryAuditSink, SecurityFramework};
use crate::storage::Namespaces;
use crate::transport::{Intake, RecipientFilter, SubmitResult, Subscription};
use crate::transport::LocalBus;
use crate::workflow::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, RecoveryReport,
    SchedulerSettings, WorkflowScheduler,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Lifetime of the token used by steps that no longer have their caller's token
const SERVICE_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Optional overrides for the pieces that talk to the outside world
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    dispatcher: Option<Arc<dyn ToolDispatcher>>,
    probe: Option<Arc<dyn HealthProbe>>,
    store: Option<Arc<dyn CheckpointStore>>,
    signing_secret: Option<String>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this secret instead of reading the configured environment variable
    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub async fn build(self) -> CoordResult<Coordinator> {
        let config = self.config;
        config.validate()?;
        let id = config.coordinator.id.clone();
        let namespaces = Namespaces::new(&config.namespaces);
        let metrics = Arc::new(MetricsCollector::new());
        let bus = LocalBus::new(config.routing.queue_capacity);

        let registry = Arc::new(ToolRegistry::new());
        for tool in &config.tools {
            registry.register(tool.capability.clone(), &tool.endpoint)?;
        }
        let agents = Arc::new(AgentDirectory::new(
            config.registry.heartbeat_interval(),
            config.registry.missed_heartbeat_threshold,
        ));

        let secret = match self.signing_secret {
            Some(secret) => secret,
            None => config.security.jwt_secret()?,
        };
        let audit = open_audit_log(&config).await?;
        let security = Arc::new(SecurityFramework::from_config(
            &config.security,
            &secret,
            audit,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(HttpDispatcher::new(config.dispatch.timeout())?),
        };
        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(
                HttpHealthProbe::new(config.registry.probe_timeout())
                    .map_err(|e| CoordError::internal(format!("probe client setup failed: {e}")))?,
            ),
        };

        let mcp = Arc::new(McpService::new(
            Arc::clone(&registry),
            Arc::clone(&security),
            dispatcher,
            &config.dispatch,
            &config.circuit_breaker,
            Arc::clone(&metrics),
        ));
        let a2a = Arc::new(A2aService::new(
            id.clone(),
            Arc::clone(&agents),
            Arc::clone(&security),
            bus.clone(),
            config.limits.step_timeout() / 2,
        ));

        let credentials: SessionCredentials = Arc::new(DashMap::new());
        let service_token = issue_service_token(&security, &registry, &id)?;
        let executor = Arc::new(LayerStepExecutor::new(
            Arc::clone(&mcp),
            Arc::clone(&a2a),
            Arc::clone(&credentials),
            Some(service_token),
        ));

        let store: Arc<dyn CheckpointStore> = match (self.store, &config.storage.checkpoint_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileCheckpointStore::open(dir, namespaces).await?),
            (None, None) => Arc::new(MemoryCheckpointStore::new(namespaces)),
        };
        let scheduler = WorkflowScheduler::new(
            executor,
            store,
            Arc::clone(&metrics),
            SchedulerSettings::from_limits(&config.limits),
        );
        let acp = Arc::new(AcpService::new(
            scheduler.clone(),
            Arc::clone(&security),
            Arc::clone(&a2a),
            credentials,
        ));

        let health_slot: HealthSlot = Arc::new(OnceCell::new());
        let table = DispatchTable::builder()
            .layer(Arc::new(McpHandler::new(Arc::clone(&mcp), id.clone())))
            .layer(Arc::new(A2aHandler::new(Arc::clone(&a2a), id.clone())))
            .layer(Arc::new(AcpHandler::new(Arc::clone(&acp), id.clone())))
            .layer(Arc::new(InfrastructureHandler::new(
                Arc::clone(&health_slot),
                bus.clone(),
                id.clone(),
            )))
            .build()?;
        let router = MessageRouter::new(
            id.clone(),
            &config.routing,
            table,
            bus.clone(),
            Arc::clone(&metrics),
        )?;

        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(ToolRegistryHealthCheck::new(Arc::clone(&registry))));
        manager.add_health_check(Box::new(AgentDirectoryHealthCheck::new(Arc::clone(&agents))));
        manager.add_health_check(Box::new(RouterHealthCheck::new(
            router.clone(),
            config.routing.queue_capacity,
        )));
        manager.add_health_check(Box::new(CircuitHealthCheck::new(Arc::clone(&mcp))));
        let health: Arc<dyn HealthSource> = Arc::new(CoordinatorHealth::new(
            manager,
            Arc::clone(&agents),
            Arc::clone(&registry),
            Arc::clone(&acp),
            router.clone(),
        ));
        // Freshly created cell, so this cannot already be set
        let _ = health_slot.set(Arc::clone(&health));

        let (shutdown_tx, _) = watch::channel(false);
        info!(coordinator_id = %id, tools = config.tools.len(), "Coordinator assembled");

        Ok(Coordinator {
            config,
            metrics,
            bus,
            registry,
            agents,
            probe,
            security,
            mcp,
            a2a,
            acp,
            scheduler,
            router,
            health,
            health_server: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }
}

async fn open_audit_log(config: &CoordinatorConfig) -> CoordResult<AuditLog> {
    match &config.storage.audit_log {
        Some(path) => {
            let existing = JsonlAuditSink::load(path)
                .await
                .map_err(|e| CoordError::internal(format!("audit log {}: {e}", path.display())))?;
            if !existing.is_empty() {
                info!(records = existing.len(), path = %path.display(), "Resuming audit chain");
            }
            Ok(AuditLog::resume(
                Arc::new(JsonlAuditSink::new(path)),
                existing.last(),
            ))
        }
        None => Ok(AuditLog::new(Arc::new(MemoryAuditSink::new()))),
    }
}

/// Periodically prune the idempotency cache, approvals and rate buckets
fn spawn_state_maintenance(
    mcp: Arc<McpService>,
    security: Arc<SecurityFramework>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let keys = mcp.prune_completed();
                    let (approvals, buckets) = security.prune();
                    if keys > 0 || approvals.evicted > 0 || buckets > 0 {
                        debug!(keys, approvals = approvals.evicted, buckets, "State maintenance pass");
                    }
                }
                _ = shutdown.changed() => {
                    info!("State maintenance stopping");
                    break;
                }
            }
        }
    })
}

/// Token carrying every scope the registered tools require
fn issue_service_token(
    security: &SecurityFramework,
    registry: &ToolRegistry,
    coordinator_id: &str,
) -> CoordResult<String> {
    let scopes: BTreeSet<String> = registry
        .statuses()
        .iter()
        .filter_map(|status| {
            registry.capability(
                &crate::registry::CapabilityQuery::new(&status.name).with_version(&status.version),
            )
        })
        .flat_map(|capability| capability.required_scopes.clone())
        .collect();
    let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    security
        .tokens()
        .issue(coordinator_id, &scopes, SERVICE_TOKEN_TTL)
}

/// A running coordination service
///
/// ```
/// use agentmesh::{Coordinator, CoordinatorConfig};
///
/// # tokio_test::block_on(async {
/// let config = CoordinatorConfig::from_toml_str(r#"
///     [coordinator]
///     id = "mesh-1"
///
///     [[tools]]
///     name = "search.web"
///     version = "1.0"
///     endpoint = "http://localhost:9100/invoke"
///     required_scopes = ["search:read"]
///     risk = "safe"
/// "#).unwrap();
///
/// let coordinator = Coordinator::builder(config)
///     .with_signing_secret("doc-secret")
///     .build()
///     .await
///     .unwrap();
/// assert_eq!(coordinator.registry().instance_count(), 1);
/// # });
/// ```
pub struct Coordinator {
    config: CoordinatorConfig,
    metrics: Arc<MetricsCollector>,
    bus: LocalBus,
    registry: Arc<ToolRegistry>,
    agents: Arc<AgentDirectory>,
    probe: Arc<dyn HealthProbe>,
    security: Arc<SecurityFramework>,
    mcp: Arc<McpService>,
    a2a: Arc<A2aService>,
    acp: Arc<AcpService>,
    scheduler: WorkflowScheduler,
    router: MessageRouter,
    health: Arc<dyn HealthSource>,
    health_server: Option<(Arc<HealthServer>, SocketAddr)>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// Recover checkpointed workflows and start background tasks
    pub async fn start(&mut self) -> CoordResult<RecoveryReport> {
        let id = self.config.coordinator.id.clone();
        info!(coordinator_id = %id, "Starting coordinator");

        if self.config.health_server.enabled {
            let server = Arc::new(HealthServer::new(
                id.clone(),
                self.config.health_server.port,
                Arc::clone(&self.metrics),
                Arc::clone(&self.health),
            ));
            let addr = Arc::clone(&server).start(self.shutdown_tx.subscribe())?;
            self.health_server = Some((server, addr));
        }

        let report = self
            .scheduler
            .recover()
            .instrument(crate::lifecycle_span!(coordinator_id = %id, phase = "recovery"))
            .await?;
        info!(
            recovered = report.recovered.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "Startup recovery finished"
        );

        let poller = HealthPoller::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.agents),
            Arc::clone(&self.probe),
            self.config.registry.health_poll_interval(),
            self.config.registry.missed_poll_threshold,
        );
        self.tasks.push(poller.spawn(self.shutdown_tx.subscribe()));
        self.tasks.push(
            self.router
                .spawn_maintenance(MAINTENANCE_INTERVAL, self.shutdown_tx.subscribe()),
        );
        self.tasks.push(spawn_state_maintenance(
            Arc::clone(&self.mcp),
            Arc::clone(&self.security),
            MAINTENANCE_INTERVAL,
            self.shutdown_tx.subscribe(),
        ));

        if let Some((server, _)) = &self.health_server {
            server.set_ready(true);
        }
        info!(coordinator_id = %id, "Coordinator running");
        Ok(report)
    }

    /// Stop background tasks. Running workflows keep their last checkpoint.
    pub async fn shutdown(&mut self) -> CoordResult<()> {
        info!(coordinator_id = %self.config.coordinator.id, "Shutting down coordinator");
        if let Some((server, _)) = &self.health_server {
            server.set_ready(false);
        }
        if self.shutdown_tx.send(true).is_err() {
            warn!("No background task was listening for shutdown");
        }

        for handle in self.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!("Background task failed during shutdown: {}", e),
                Err(_) => warn!("Background task did not stop within 5s"),
            }
        }

        info!("Coordinator shutdown complete");
        Ok(())
    }

    pub async fn health(&self) -> HealthStatus {
        self.health.health().await
    }

    /// Validate and route a raw envelope
    pub async fn submit(&self, envelope: Value) -> SubmitResult {
        self.router.submit(envelope).await
    }

    pub fn subscribe(&self, filter: RecipientFilter) -> Subscription {
        self.router.subscribe(filter)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.agents
    }

    pub fn security(&self) -> &Arc<SecurityFramework> {
        &self.security
    }

    pub fn mcp(&self) -> &Arc<McpService> {
        &self.mcp
    }

    pub fn a2a(&self) -> &Arc<A2aService> {
        &self.a2a
    }

    pub fn acp(&self) -> &Arc<AcpService> {
        &self.acp
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        &self.scheduler
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Bound address of the health server, once started
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_server.as_ref().map(|(_, addr)| *addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolRegistration;
    use crate::protocol::{Intent, ProtocolMessage, Recipient};
    use crate::registry::{RiskLevel, ToolCapability};
    use crate::testing::mocks::{issue_test_token, MockDispatcher, MockProbe, TEST_SECRET};
    use serde_json::json;

    fn config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::test_config();
        config.tools = vec![ToolRegistration {
            capability: ToolCapability::new("search.web", "1.0", RiskLevel::Safe)
                .with_scopes(["search:read"]),
            endpoint: "http://search-1".to_string(),
        }];
        config
    }

    async fn coordinator(dispatcher: Arc<MockDispatcher>) -> Coordinator {
        Coordinator::builder(config())
            .with_dispatcher(dispatcher)
            .with_probe(Arc::new(MockProbe::new()))
            .with_signing_secret(TEST_SECRET)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_service_token_carries_tool_scopes() {
        let coordinator = coordinator(Arc::new(MockDispatcher::new())).await;
        let token = issue_service_token(
            coordinator.security(),
            coordinator.registry(),
            "agentmesh",
        )
        .unwrap();
        let claims = coordinator.security().tokens().validate(&token).unwrap();
        assert!(claims.has_scope("search:read"));
    }

    #[tokio::test]
    async fn test_tool_request_round_trip() {
        let dispatcher = Arc::new(MockDispatcher::new());
        dispatcher.respond("http://search-1", json!({"hits": 3}));
        let mut coordinator = coordinator(Arc::clone(&dispatcher)).await;
        coordinator.start().await.unwrap();

        let token = issue_test_token(coordinator.security(), "planner", &["search:read"]);
        let request = ProtocolMessage::new(
            Intent::ToolRequest,
            "planner",
            Recipient::Tool("search.web".to_string()),
            json!({"tool": "search.web", "arguments": {"q": "rust"}, "auth_token": token}),
        );
        let mut replies = coordinator.subscribe(RecipientFilter::agent("planner"));
        let result = coordinator
            .submit(serde_json::to_value(&request).unwrap())
            .await;
        assert!(result.accepted, "{result:?}");

        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.intent, Intent::ToolResponse);
        assert_eq!(reply.metadata.correlation_id, request.metadata.correlation_id);
        assert_eq!(reply.payload["result"]["hits"], 3);

        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_message_answered() {
        let mut coordinator = coordinator(Arc::new(MockDispatcher::new())).await;
        coordinator.start().await.unwrap();

        let probe = ProtocolMessage::new(
            Intent::HealthCheck,
            "monitor",
            Recipient::Agent("test-coordinator".to_string()),
            json!({}),
        );
        let mut replies = coordinator.subscribe(RecipientFilter::agent("monitor"));
        assert!(coordinator.submit(serde_json::to_value(&probe).unwrap()).await.accepted);

        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.intent, Intent::HealthCheck);
        assert_eq!(reply.payload["tool_instances"], 1);

        coordinator.shutdown().await.unwrap();
    }
}

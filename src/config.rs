//! Configuration for the coordination service
//!
//! Configuration is loaded from TOML. Every section except `[coordinator]` is
//! optional and falls back to the documented defaults. Secrets are never stored
//! in the file; the file names the environment variable that holds them.

use crate::registry::capability::ToolCapability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main coordinator configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub namespaces: NamespaceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub health_server: HealthServerConfig,
    /// Tools registered at startup
    #[serde(default)]
    pub tools: Vec<ToolRegistration>,
}

/// Coordinator identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorSection {
    /// Coordinator identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Key prefixes for the typed state stores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceConfig {
    #[serde(default = "default_agent_prefix")]
    pub agent: String,
    #[serde(default = "default_workflow_prefix")]
    pub workflow: String,
    #[serde(default = "default_event_prefix")]
    pub event: String,
    #[serde(default = "default_metrics_prefix")]
    pub metrics: String,
}

fn default_agent_prefix() -> String {
    "agent_coordination".to_string()
}

fn default_workflow_prefix() -> String {
    "workflow".to_string()
}

fn default_event_prefix() -> String {
    "events".to_string()
}

fn default_metrics_prefix() -> String {
    "metrics".to_string()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            agent: default_agent_prefix(),
            workflow: default_workflow_prefix(),
            event: default_event_prefix(),
            metrics: default_metrics_prefix(),
        }
    }
}

/// Workflow and context limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum characters of dependency output handed to a delegated step
    #[serde(default = "default_max_context_size")]
    pub max_context_size: usize,
    /// Workflows allowed to run at once; excess submissions wait in FIFO order
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    /// Upper bound for a single step invocation
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

fn default_max_context_size() -> usize {
    4000
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_recovery_timeout() -> u64 {
    30
}

fn default_step_timeout() -> u64 {
    120
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_context_size: default_max_context_size(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            recovery_timeout_secs: default_recovery_timeout(),
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl LimitsConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Health polling and heartbeat tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_secs: u64,
    /// Consecutive missed polls before a tool instance is marked offline
    #[serde(default = "default_missed_threshold")]
    pub missed_poll_threshold: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeat intervals before an agent is removed
    #[serde(default = "default_missed_threshold")]
    pub missed_heartbeat_threshold: u32,
    /// Timeout for a single health probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_health_poll_interval() -> u64 {
    10
}

fn default_missed_threshold() -> u32 {
    3
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_poll_interval_secs: default_health_poll_interval(),
            missed_poll_threshold: default_missed_threshold(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            missed_heartbeat_threshold: default_missed_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Token validation, approvals and rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Environment variable holding the HS256 signing secret
    #[serde(default = "default_jwt_secret_env")]
    pub jwt_secret_env: String,
    #[serde(default = "default_approval_expiry")]
    pub approval_expiry_secs: u64,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_bucket_size")]
    pub rate_limit_bucket_size: u32,
    /// Per action-class overrides of the default bucket
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitRule>,
}

/// Token bucket shape for one action class
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitRule {
    pub bucket_size: u32,
    pub window_secs: u64,
}

fn default_jwt_secret_env() -> String {
    "AGENTMESH_JWT_SECRET".to_string()
}

fn default_approval_expiry() -> u64 {
    300
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_rate_limit_bucket_size() -> u32 {
    60
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_secret_env: default_jwt_secret_env(),
            approval_expiry_secs: default_approval_expiry(),
            rate_limit_window_secs: default_rate_limit_window(),
            rate_limit_bucket_size: default_rate_limit_bucket_size(),
            rate_limits: HashMap::new(),
        }
    }
}

impl SecurityConfig {
    pub fn approval_expiry(&self) -> Duration {
        Duration::from_secs(self.approval_expiry_secs)
    }

    /// Bucket used when an action class has no explicit rule
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule {
            bucket_size: self.rate_limit_bucket_size,
            window_secs: self.rate_limit_window_secs,
        }
    }

    /// Resolve the signing secret from the environment
    pub fn jwt_secret(&self) -> Result<String, ConfigError> {
        std::env::var(&self.jwt_secret_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.jwt_secret_env.clone()))
    }
}

/// Tool dispatch timeout and retry backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per endpoint, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// How long a completed invocation can be replayed by its idempotency key
    #[serde(default = "default_idempotency_retention")]
    pub idempotency_retention_secs: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_idempotency_retention() -> u64 {
    3600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            idempotency_retention_secs: default_idempotency_retention(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(self.idempotency_retention_secs)
    }
}

/// Per-endpoint circuit breaker tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Message router tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Re-queues allowed for a retryable delivery failure
    #[serde(default = "default_max_delivery_retries")]
    pub max_delivery_retries: u32,
    /// Capacity of each per-layer queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_delivery_retries() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_delivery_retries: default_max_delivery_retries(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Durable state locations; in-memory stores are used when unset
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub checkpoint_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

/// Health HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

/// Static tool registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRegistration {
    #[serde(flatten)]
    pub capability: ToolCapability,
    /// Base URL of the tool instance
    pub endpoint: String,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid coordinator ID format: {0}")]
    InvalidCoordinatorId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSection {
                id: "agentmesh".to_string(),
                description: "Agent coordination service".to_string(),
            },
            namespaces: NamespaceConfig::default(),
            limits: LimitsConfig::default(),
            registry: RegistryConfig::default(),
            security: SecurityConfig::default(),
            dispatch: DispatchConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            routing: RoutingConfig::default(),
            storage: StorageConfig::default(),
            health_server: HealthServerConfig::default(),
            tools: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check identifiers, limits and static tool registrations
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_coordinator_id(&self.coordinator.id)?;

        let positive = [
            ("limits.max_context_size", self.limits.max_context_size as u64),
            (
                "limits.max_concurrent_workflows",
                self.limits.max_concurrent_workflows as u64,
            ),
            ("limits.recovery_timeout_secs", self.limits.recovery_timeout_secs),
            ("limits.step_timeout_secs", self.limits.step_timeout_secs),
            (
                "registry.health_poll_interval_secs",
                self.registry.health_poll_interval_secs,
            ),
            (
                "registry.missed_poll_threshold",
                u64::from(self.registry.missed_poll_threshold),
            ),
            (
                "registry.heartbeat_interval_secs",
                self.registry.heartbeat_interval_secs,
            ),
            (
                "registry.missed_heartbeat_threshold",
                u64::from(self.registry.missed_heartbeat_threshold),
            ),
            (
                "security.rate_limit_window_secs",
                self.security.rate_limit_window_secs,
            ),
            (
                "security.rate_limit_bucket_size",
                u64::from(self.security.rate_limit_bucket_size),
            ),
            ("dispatch.timeout_ms", self.dispatch.timeout_ms),
            ("dispatch.max_attempts", u64::from(self.dispatch.max_attempts)),
            (
                "circuit_breaker.failure_threshold",
                u64::from(self.circuit_breaker.failure_threshold),
            ),
            ("routing.queue_capacity", self.routing.queue_capacity as u64),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.dispatch.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        for (class, rule) in &self.security.rate_limits {
            if rule.bucket_size == 0 || rule.window_secs == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "rate limit for '{class}' must have a positive bucket_size and window_secs"
                )));
            }
        }

        for tool in &self.tools {
            if tool.capability.name.trim().is_empty() || tool.capability.version.trim().is_empty()
            {
                return Err(ConfigError::InvalidConfig(
                    "tool registrations need a name and a version".to_string(),
                ));
            }
            url::Url::parse(&tool.endpoint).map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "tool '{}' has an invalid endpoint '{}': {e}",
                    tool.capability.name, tool.endpoint
                ))
            })?;
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[coordinator]
id = "test-coordinator"
description = "A test coordinator"

[[tools]]
name = "calendar.create_event"
version = "1.0.0"
endpoint = "http://localhost:9100"
required_scopes = ["calendar:write"]
risk = "sensitive"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate coordinator ID format
fn validate_coordinator_id(id: &str) -> Result<(), ConfigError> {
    if !crate::protocol::ids::is_valid_id(id) {
        return Err(ConfigError::InvalidCoordinatorId(format!(
            "Coordinator ID '{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::capability::RiskLevel;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[coordinator]
id = "mesh-1"
description = "Coordinator under test"

[namespaces]
agent = "coord"

[limits]
max_context_size = 2000
max_concurrent_workflows = 4

[security]
jwt_secret_env = "MESH_SECRET"
approval_expiry_secs = 30

[security.rate_limits."tool.invoke"]
bucket_size = 5
window_secs = 1

[circuit_breaker]
failure_threshold = 2
cooldown_ms = 100

[[tools]]
name = "email.send"
version = "2.1.0"
endpoint = "https://tools.internal/email"
required_scopes = ["email:send"]
risk = "dangerous"
description = "Send an email"
input_schema = { type = "object", required = ["to"] }
"#;

        let config = CoordinatorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.coordinator.id, "mesh-1");
        assert_eq!(config.namespaces.agent, "coord");
        assert_eq!(config.namespaces.workflow, "workflow");
        assert_eq!(config.limits.max_context_size, 2000);
        assert_eq!(config.limits.recovery_timeout_secs, 30);
        assert_eq!(config.security.approval_expiry_secs, 30);
        assert_eq!(config.security.rate_limits["tool.invoke"].bucket_size, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.tools.len(), 1);

        let tool = &config.tools[0];
        assert_eq!(tool.capability.risk, RiskLevel::Dangerous);
        assert_eq!(tool.capability.required_scopes, vec!["email:send"]);
        assert!(tool.capability.input_schema.is_some());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = CoordinatorConfig::from_toml_str("[coordinator]\nid = \"minimal\"\n").unwrap();

        assert_eq!(config.limits.max_context_size, 4000);
        assert_eq!(config.limits.max_concurrent_workflows, 10);
        assert_eq!(config.limits.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.registry.missed_poll_threshold, 3);
        assert_eq!(config.security.rate_limit_bucket_size, 60);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.routing.max_delivery_retries, 3);
        assert!(config.tools.is_empty());
        assert!(!config.health_server.enabled);
    }

    #[test]
    fn test_test_config_parses() {
        let config = CoordinatorConfig::test_config();
        assert_eq!(config.tools[0].capability.risk, RiskLevel::Sensitive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_coordinator_id() {
        assert!(validate_coordinator_id("invalid@coordinator").is_err());
        assert!(validate_coordinator_id("").is_err());
        assert!(validate_coordinator_id("valid-coordinator_1.test").is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = CoordinatorConfig::from_toml_str(
            "[coordinator]\nid = \"x\"\n[limits]\nmax_concurrent_workflows = 0\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("max_concurrent_workflows")));
    }

    #[test]
    fn test_invalid_tool_endpoint_rejected() {
        let result = CoordinatorConfig::from_toml_str(
            r#"
[coordinator]
id = "x"

[[tools]]
name = "t"
version = "1"
endpoint = "not a url"
risk = "safe"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_jwt_secret_missing_env() {
        let security = SecurityConfig {
            jwt_secret_env: "AGENTMESH_TEST_SECRET_THAT_IS_NOT_SET".to_string(),
            ..SecurityConfig::default()
        };
        assert!(matches!(
            security.jwt_secret(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "AGENTMESH_TEST_SECRET_THAT_IS_NOT_SET"
        ));
    }
}

//! The three protocol layers and the handlers that bind them to the router
//!
//! MCP invokes tools, A2A carries peer traffic and delegations, ACP runs
//! workflows over sessions.

pub mod a2a;
pub mod acp;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod handlers;
pub mod mcp;

pub use a2a::{A2aService, Delegation, DirectDelivery};
pub use acp::{
    AcpService, AcpSession, CONTROL_SCOPE, ExecutionSummary, LayerStepExecutor, RUN_SCOPE,
    SessionCredentials,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use dispatcher::{DispatchRequest, HttpDispatcher, RetryPolicy, ToolDispatcher};
pub use handlers::{A2aHandler, AcpHandler, HealthSlot, InfrastructureHandler, McpHandler};
pub use mcp::{InvocationOutcome, McpService, ToolInvocation};

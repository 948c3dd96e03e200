//! Layer entry points for routed messages
//!
//! One handler per layer. Requests that produce an answer reply with a message
//! correlated to the request: `tool-response` for tool, workflow and session
//! requests, `capability-negotiation` for negotiations and `health-check` for
//! health probes.

use super::a2a::A2aService;
use super::acp::AcpService;
use super::mcp::{McpService, ToolInvocation};
use crate::error::{CoordError, CoordResult};
use crate::health::HealthSource;
use crate::protocol::{
    DirectPayload, Intent, Layer, NegotiationPayload, ProtocolMessage, Recipient,
    ToolRequestPayload,
};
use crate::routing::LayerHandler;
use crate::transport::LocalBus;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

fn payload<T: DeserializeOwned>(message: &ProtocolMessage) -> CoordResult<T> {
    serde_json::from_value(message.payload.clone())
        .map_err(|e| CoordError::schema(format!("{} payload: {e}", message.intent)))
}

fn unexpected(layer: Layer, message: &ProtocolMessage) -> CoordError {
    CoordError::internal(format!("{layer} layer cannot handle {}", message.intent))
}

fn addressed_to(message: &ProtocolMessage, id: &str) -> bool {
    matches!(&message.metadata.recipient, Recipient::Agent(agent) if agent == id)
}

pub struct McpHandler {
    mcp: Arc<McpService>,
    sender_id: String,
}

impl McpHandler {
    pub fn new(mcp: Arc<McpService>, sender_id: impl Into<String>) -> Self {
        Self {
            mcp,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl LayerHandler for McpHandler {
    fn layer(&self) -> Layer {
        Layer::Mcp
    }

    async fn handle(&self, message: &ProtocolMessage) -> CoordResult<Option<ProtocolMessage>> {
        if message.intent != Intent::ToolRequest {
            return Err(unexpected(self.layer(), message));
        }
        let request: ToolRequestPayload = payload(message)?;
        let outcome = self
            .mcp
            .invoke(ToolInvocation::from_request(request, message.id))
            .await?;

        Ok(Some(message.reply(
            Intent::ToolResponse,
            self.sender_id.clone(),
            json!({ "result": outcome.result }),
        )))
    }
}

pub struct A2aHandler {
    a2a: Arc<A2aService>,
    sender_id: String,
}

impl A2aHandler {
    pub fn new(a2a: Arc<A2aService>, sender_id: impl Into<String>) -> Self {
        Self {
            a2a,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl LayerHandler for A2aHandler {
    fn layer(&self) -> Layer {
        Layer::A2a
    }

    async fn handle(&self, message: &ProtocolMessage) -> CoordResult<Option<ProtocolMessage>> {
        match message.intent {
            Intent::AgentDirect => {
                let direct: DirectPayload = payload(message)?;
                self.a2a.send_direct(message, &direct.session_id).await?;
                Ok(None)
            }
            Intent::CapabilityNegotiation => {
                let negotiation: NegotiationPayload = payload(message)?;
                let common = self.a2a.negotiate(
                    &negotiation.agent_a,
                    &negotiation.agent_b,
                    &negotiation.proposed,
                )?;
                let agreed = NegotiationPayload {
                    agent_a: negotiation.agent_a,
                    agent_b: negotiation.agent_b,
                    proposed: common,
                };
                Ok(Some(message.reply(
                    Intent::CapabilityNegotiation,
                    self.sender_id.clone(),
                    serde_json::to_value(agreed)
                        .map_err(|e| CoordError::internal(format!("negotiation reply: {e}")))?,
                )))
            }
            Intent::ToolResponse => {
                if self.a2a.complete_delegation(message) {
                    debug!(correlation_id = %message.metadata.correlation_id, "Delegation answered");
                } else if !addressed_to(message, &self.sender_id) {
                    self.a2a.relay(message);
                } else {
                    debug!(correlation_id = %message.metadata.correlation_id, "Ignoring unmatched response");
                }
                Ok(None)
            }
            Intent::TaskDelegation => {
                self.a2a.relay(message);
                Ok(None)
            }
            _ => Err(unexpected(self.layer(), message)),
        }
    }
}

pub struct AcpHandler {
    acp: Arc<AcpService>,
    sender_id: String,
}

impl AcpHandler {
    pub fn new(acp: Arc<AcpService>, sender_id: impl Into<String>) -> Self {
        Self {
            acp,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl LayerHandler for AcpHandler {
    fn layer(&self) -> Layer {
        Layer::Acp
    }

    async fn handle(&self, message: &ProtocolMessage) -> CoordResult<Option<ProtocolMessage>> {
        let result: Value = match message.intent {
            Intent::WorkflowControl => self.acp.control(message).await?,
            Intent::SessionManagement => self.acp.session(message).await?,
            _ => return Err(unexpected(self.layer(), message)),
        };
        Ok(Some(message.reply(
            Intent::ToolResponse,
            self.sender_id.clone(),
            json!({ "result": result }),
        )))
    }
}

/// Health source shared with the handler once the coordinator is assembled
pub type HealthSlot = Arc<OnceCell<Arc<dyn HealthSource>>>;

pub struct InfrastructureHandler {
    health: HealthSlot,
    bus: LocalBus,
    sender_id: String,
}

impl InfrastructureHandler {
    pub fn new(health: HealthSlot, bus: LocalBus, sender_id: impl Into<String>) -> Self {
        Self {
            health,
            bus,
            sender_id: sender_id.into(),
        }
    }
}

#[async_trait]
impl LayerHandler for InfrastructureHandler {
    fn layer(&self) -> Layer {
        Layer::Infrastructure
    }

    async fn handle(&self, message: &ProtocolMessage) -> CoordResult<Option<ProtocolMessage>> {
        match message.intent {
            Intent::HealthCheck => {
                let source = self
                    .health
                    .get()
                    .ok_or_else(|| CoordError::internal("health reporting not ready"))?;
                let status = serde_json::to_value(source.health().await)
                    .map_err(|e| CoordError::internal(format!("health encoding: {e}")))?;
                Ok(Some(message.reply(
                    Intent::HealthCheck,
                    self.sender_id.clone(),
                    status,
                )))
            }
            Intent::Error => {
                warn!(
                    from = %message.metadata.sender,
                    correlation_id = %message.metadata.correlation_id,
                    error = %message.payload,
                    "Error reported"
                );
                if !addressed_to(message, &self.sender_id) {
                    self.bus.publish(message.clone());
                }
                Ok(None)
            }
            _ => Err(unexpected(self.layer(), message)),
        }
    }
}

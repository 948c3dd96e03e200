//! Peer-to-peer agent layer
//!
//! Direct messages within a session are forwarded one at a time in send order
//! and stamped with a per-session sequence number. When the addressed agent is
//! not selectable, the message goes to the best ranked agent offering the same
//! capability instead. Step delegations share the same ordered lane and
//! sequence numbering as the session's direct messages.

use crate::error::{CoordError, CoordResult, FailureKind};
use crate::protocol::{
    DelegationPayload, DirectPayload, Intent, ProtocolMessage, Recipient, ToolResponsePayload,
};
use crate::registry::{AgentDirectory, AgentProfile};
use crate::security::{action, SecurityFramework};
use crate::transport::LocalBus;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of forwarding a direct message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectDelivery {
    /// Id of the forwarded message
    pub message_id: Uuid,
    pub session_id: String,
    /// Position of this message within its session, starting at 0
    pub sequence: u64,
    pub delivered_to: String,
    /// The addressed agent was unavailable and a substitute received it
    pub failed_over: bool,
}

/// A step handed to an agent
#[derive(Debug, Clone, PartialEq)]
pub struct Delegation {
    pub session_id: String,
    pub step_id: String,
    pub capability: String,
    pub instruction: Option<String>,
    pub input: Value,
    /// How long each agent gets to answer; the service default when unset
    pub attempt_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct SessionLane {
    next_sequence: u64,
}

struct PendingDelegation {
    capability: String,
    reply: oneshot::Sender<CoordResult<Value>>,
}

/// Removes a delegation from the pending table however its wait ends
struct PendingEntry<'a> {
    pending: &'a DashMap<Uuid, PendingDelegation>,
    correlation_id: Uuid,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct A2aService {
    sender_id: String,
    agents: Arc<AgentDirectory>,
    security: Arc<SecurityFramework>,
    bus: LocalBus,
    sessions: DashMap<String, Arc<Mutex<SessionLane>>>,
    pending: DashMap<Uuid, PendingDelegation>,
    delegation_timeout: Duration,
}

impl std::fmt::Debug for A2aService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2aService")
            .field("sessions", &self.sessions.len())
            .field("pending", &self.pending.len())
            .field("delegation_timeout", &self.delegation_timeout)
            .finish()
    }
}

impl A2aService {
    pub fn new(
        sender_id: impl Into<String>,
        agents: Arc<AgentDirectory>,
        security: Arc<SecurityFramework>,
        bus: LocalBus,
        delegation_timeout: Duration,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            agents,
            security,
            bus,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            delegation_timeout,
        }
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.agents
    }

    /// Selectable agents offering every listed capability, best first
    pub fn discover_agents(&self, capabilities: &[String]) -> Vec<AgentProfile> {
        self.agents.find_by_capabilities(capabilities)
    }

    /// Capabilities both agents share, narrowed to `proposed` when it is non-empty
    pub fn negotiate(
        &self,
        agent_a: &str,
        agent_b: &str,
        proposed: &[String],
    ) -> CoordResult<Vec<String>> {
        let a = self.known_agent(agent_a)?;
        let b = self.known_agent(agent_b)?;

        let common: Vec<String> = a
            .capabilities
            .intersection(&b.capabilities)
            .filter(|capability| proposed.is_empty() || proposed.contains(capability))
            .cloned()
            .collect();

        if common.is_empty() {
            return Err(CoordError::NoCommonCapability {
                agent_a: agent_a.to_string(),
                agent_b: agent_b.to_string(),
            });
        }
        debug!(agent_a, agent_b, ?common, "Negotiated capabilities");
        Ok(common)
    }

    fn known_agent(&self, agent_id: &str) -> CoordResult<AgentProfile> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| CoordError::invalid_input(format!("unknown agent '{agent_id}'")))
    }

    fn lane(&self, session_id: &str) -> Arc<Mutex<SessionLane>> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Forward an `agent-direct` message within `session_id`
    pub async fn send_direct(
        &self,
        message: &ProtocolMessage,
        session_id: &str,
    ) -> CoordResult<DirectDelivery> {
        let Recipient::Agent(target) = &message.metadata.recipient else {
            return Err(CoordError::invalid_input("direct messages must address an agent"));
        };
        let sender = &message.metadata.sender;
        self.security
            .enforce_rate_limit(sender, action::AGENT_MESSAGE)
            .await?;

        let payload: DirectPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| CoordError::schema(format!("agent-direct payload: {e}")))?;
        let (recipient, failed_over) = self.resolve(target, payload.capability.as_deref())?;

        let (message_id, sequence) = self
            .publish_ordered(session_id, |sequence| {
                Ok(ProtocolMessage::new(
                    Intent::AgentDirect,
                    sender.clone(),
                    Recipient::Agent(recipient.clone()),
                    json!({
                        "session_id": session_id,
                        "sequence": sequence,
                        "capability": payload.capability,
                        "body": payload.body,
                    }),
                )
                .with_priority(message.priority)
                .caused_by(message))
            })
            .await?;

        debug!(session_id, sequence, to = %recipient, failed_over, "Direct message forwarded");
        Ok(DirectDelivery {
            message_id,
            session_id: session_id.to_string(),
            sequence,
            delivered_to: recipient,
            failed_over,
        })
    }

    /// Publish under the session lane lock with the lane's next sequence number
    async fn publish_ordered<F>(&self, session_id: &str, build: F) -> CoordResult<(Uuid, u64)>
    where
        F: FnOnce(u64) -> CoordResult<ProtocolMessage>,
    {
        let lane = self.lane(session_id);
        let mut lane = lane.lock().await;

        let sequence = lane.next_sequence;
        let message = build(sequence)?;
        let message_id = message.id;
        self.bus.publish(message);
        lane.next_sequence += 1;
        Ok((message_id, sequence))
    }

    /// Addressed agent if selectable, otherwise the best agent with the same capability
    fn resolve(&self, target: &str, capability: Option<&str>) -> CoordResult<(String, bool)> {
        let profile = self.agents.get(target);
        if let Some(profile) = &profile {
            if profile.liveness.is_selectable() {
                return Ok((target.to_string(), false));
            }
        }

        let required: Vec<String> = match (capability, &profile) {
            (Some(capability), _) => vec![capability.to_string()],
            (None, Some(profile)) => profile.capabilities.iter().cloned().collect(),
            (None, None) => return Err(CoordError::no_available_instance(target)),
        };

        let substitute = self
            .agents
            .find_by_capabilities(&required)
            .into_iter()
            .find(|candidate| candidate.agent_id != target)
            .ok_or_else(|| CoordError::no_available_instance(required.join(",")))?;

        warn!(
            target,
            substitute = %substitute.agent_id,
            "Addressed agent unavailable, failing over"
        );
        Ok((substitute.agent_id, true))
    }

    /// Hand a workflow step to the best agent for its capability and wait for
    /// the answer. A timed-out agent is replaced once by the next ranked agent,
    /// so a delegation takes at most two attempt timeouts.
    ///
    /// The `task-delegation` message takes the next sequence number of the
    /// session lane, exactly like a direct message sent with `send_direct`.
    pub async fn delegate(&self, delegation: Delegation) -> CoordResult<Value> {
        self.security
            .enforce_rate_limit(&self.sender_id, action::TASK_DELEGATION)
            .await?;

        let mut tried: Vec<String> = Vec::new();
        loop {
            let excluded: Vec<&str> = tried.iter().map(String::as_str).collect();
            let agent = self
                .agents
                .select_for_capability(&delegation.capability, &excluded)?;

            match self.delegate_to(&agent.agent_id, &delegation).await {
                Err(CoordError::ToolInvocation {
                    kind: FailureKind::Transient,
                    ..
                }) if tried.is_empty() => {
                    warn!(
                        agent_id = %agent.agent_id,
                        step_id = %delegation.step_id,
                        "Delegation timed out, trying next agent"
                    );
                    tried.push(agent.agent_id);
                }
                result => return result,
            }
        }
    }

    async fn delegate_to(&self, agent_id: &str, delegation: &Delegation) -> CoordResult<Value> {
        let timeout = delegation.attempt_timeout.unwrap_or(self.delegation_timeout);
        let correlation_id = Uuid::new_v4();

        let (reply, response) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingDelegation {
                capability: delegation.capability.clone(),
                reply,
            },
        );
        let _entry = PendingEntry {
            pending: &self.pending,
            correlation_id,
        };

        let (_, sequence) = self
            .publish_ordered(&delegation.session_id, |sequence| {
                let payload = DelegationPayload {
                    session_id: delegation.session_id.clone(),
                    step_id: delegation.step_id.clone(),
                    capability: delegation.capability.clone(),
                    instruction: delegation.instruction.clone(),
                    input: delegation.input.clone(),
                    sequence: Some(sequence),
                };
                let mut message = ProtocolMessage::new(
                    Intent::TaskDelegation,
                    self.sender_id.clone(),
                    Recipient::Agent(agent_id.to_string()),
                    serde_json::to_value(&payload)
                        .map_err(|e| CoordError::internal(format!("delegation payload: {e}")))?,
                );
                message.metadata.correlation_id = correlation_id;
                Ok(message)
            })
            .await?;
        info!(
            agent_id,
            session_id = %delegation.session_id,
            step_id = %delegation.step_id,
            sequence,
            "Delegated step"
        );

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoordError::internal("delegation reply channel closed")),
            Err(_) => Err(CoordError::tool_invocation(
                &delegation.capability,
                FailureKind::Transient,
                format!(
                    "agent '{agent_id}' did not answer within {}ms",
                    timeout.as_millis()
                ),
            )),
        }
    }

    /// Resolve a pending delegation from its `tool-response`.
    ///
    /// Returns false when the response answers no pending delegation.
    pub fn complete_delegation(&self, response: &ProtocolMessage) -> bool {
        let Some((_, pending)) = self.pending.remove(&response.metadata.correlation_id) else {
            return false;
        };

        let result = match serde_json::from_value::<ToolResponsePayload>(response.payload.clone()) {
            Ok(ToolResponsePayload {
                error: Some(error), ..
            }) => Err(CoordError::tool_invocation(
                &pending.capability,
                if error.retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                },
                error.message,
            )),
            Ok(payload) => Ok(payload.result.unwrap_or(Value::Null)),
            Err(e) => Err(CoordError::schema(format!("delegation response: {e}"))),
        };

        if pending.reply.send(result).is_err() {
            debug!(correlation_id = %response.metadata.correlation_id, "Delegation answered after its caller gave up");
        }
        true
    }

    /// Pass a message on to its recipient unchanged
    pub fn relay(&self, message: &ProtocolMessage) {
        self.bus.publish(message.clone());
    }

    /// Drop a session's ordering state
    pub fn close_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_delegations(&self) -> usize {
        self.pending.len()
    }

    /// Capabilities currently offered by any selectable agent
    pub fn offered_capabilities(&self) -> BTreeSet<String> {
        self.agents
            .all()
            .into_iter()
            .filter(|profile| profile.liveness.is_selectable())
            .flat_map(|profile| profile.capabilities)
            .collect()
    }
}

//! Protocol message types for the agent coordination protocol
//!
//! This module defines the envelope shared by all three layers, the intent and
//! priority enums, recipient addressing, and the typed payloads carried by
//! each intent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default time-to-live for envelopes built with [`ProtocolMessage::new`]
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Protocol message envelope
///
/// This is the only message type accepted by the intake. Every field except
/// `payload` is required on the wire.
///
/// # Examples
/// ```
/// use agentmesh::protocol::{Intent, ProtocolMessage, Recipient};
/// use serde_json::json;
///
/// let message = ProtocolMessage::new(
///     Intent::ToolRequest,
///     "planner-agent",
///     Recipient::Tool("calendar.create_event".to_string()),
///     json!({"tool": "calendar.create_event", "auth_token": "t", "arguments": {}}),
/// );
/// assert_eq!(message.metadata.correlation_id, message.id);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    /// Globally unique, immutable message id
    pub id: Uuid,
    pub intent: Intent,
    pub priority: Priority,
    pub metadata: MessageMetadata,
    /// Opaque payload, shape depends on intent
    #[serde(default)]
    pub payload: Value,
}

/// Envelope metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Sending agent id
    pub sender: String,
    /// Addressed agent, tool, session, or topic
    pub recipient: Recipient,
    /// Links a request to all of its responses
    pub correlation_id: Uuid,
    /// Id of the message that caused this one (null for root messages)
    pub causation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Time-to-live in seconds, counted from `created_at`
    pub ttl: u64,
}

impl ProtocolMessage {
    /// Create a root message with a fresh id, normal priority and default ttl
    pub fn new(
        intent: Intent,
        sender: impl Into<String>,
        recipient: Recipient,
        payload: Value,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            intent,
            priority: Priority::Normal,
            metadata: MessageMetadata {
                sender: sender.into(),
                recipient,
                correlation_id: id,
                causation_id: None,
                created_at: Utc::now(),
                ttl: DEFAULT_TTL_SECS,
            },
            payload,
        }
    }

    /// Builder method to set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the ttl in seconds
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.metadata.ttl = ttl_secs;
        self
    }

    /// Builder method to link this message into an existing conversation
    pub fn caused_by(mut self, cause: &ProtocolMessage) -> Self {
        self.metadata.correlation_id = cause.metadata.correlation_id;
        self.metadata.causation_id = Some(cause.id);
        self
    }

    /// Build a reply addressed back to this message's sender.
    ///
    /// The reply shares the correlation id and names this message as its cause.
    pub fn reply(&self, intent: Intent, sender: impl Into<String>, payload: Value) -> Self {
        ProtocolMessage::new(
            intent,
            sender,
            Recipient::Agent(self.metadata.sender.clone()),
            payload,
        )
        .with_priority(self.priority)
        .caused_by(self)
    }

    /// Instant after which the message is undeliverable
    pub fn expires_at(&self) -> DateTime<Utc> {
        // A ttl past the representable range never expires
        i64::try_from(self.metadata.ttl)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|ttl| self.metadata.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check expiry against a supplied clock
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Check expiry against the wall clock
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Message intent
///
/// Unknown intent strings fail deserialization, which the validator reports as
/// a schema error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    ToolRequest,
    ToolResponse,
    AgentDirect,
    CapabilityNegotiation,
    WorkflowControl,
    TaskDelegation,
    SessionManagement,
    Error,
    HealthCheck,
}

impl Intent {
    /// Every intent, used to check dispatch table completeness
    pub const ALL: [Intent; 9] = [
        Intent::ToolRequest,
        Intent::ToolResponse,
        Intent::AgentDirect,
        Intent::CapabilityNegotiation,
        Intent::WorkflowControl,
        Intent::TaskDelegation,
        Intent::SessionManagement,
        Intent::Error,
        Intent::HealthCheck,
    ];

    /// Layer service that owns this intent
    pub fn layer(&self) -> Layer {
        match self {
            Intent::ToolRequest => Layer::Mcp,
            Intent::ToolResponse
            | Intent::AgentDirect
            | Intent::CapabilityNegotiation
            | Intent::TaskDelegation => Layer::A2a,
            Intent::WorkflowControl | Intent::SessionManagement => Layer::Acp,
            Intent::Error | Intent::HealthCheck => Layer::Infrastructure,
        }
    }

    /// Whether this intent may address the given recipient
    pub fn accepts(&self, recipient: &Recipient) -> bool {
        match self {
            Intent::ToolRequest => matches!(recipient, Recipient::Tool(_)),
            Intent::ToolResponse => {
                matches!(recipient, Recipient::Agent(_) | Recipient::Topic(_))
            }
            Intent::AgentDirect | Intent::CapabilityNegotiation => {
                matches!(recipient, Recipient::Agent(_))
            }
            Intent::TaskDelegation => {
                matches!(recipient, Recipient::Agent(_) | Recipient::Topic(_))
            }
            Intent::WorkflowControl | Intent::SessionManagement => {
                matches!(recipient, Recipient::Session(_))
            }
            Intent::Error | Intent::HealthCheck => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ToolRequest => "tool-request",
            Intent::ToolResponse => "tool-response",
            Intent::AgentDirect => "agent-direct",
            Intent::CapabilityNegotiation => "capability-negotiation",
            Intent::WorkflowControl => "workflow-control",
            Intent::TaskDelegation => "task-delegation",
            Intent::SessionManagement => "session-management",
            Intent::Error => "error",
            Intent::HealthCheck => "health-check",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layer services messages are routed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Tool integration layer
    Mcp,
    /// Peer-to-peer agent layer
    A2a,
    /// Workflow orchestration layer
    Acp,
    /// Handled by the routing infrastructure itself
    Infrastructure,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Mcp => "mcp",
            Layer::A2a => "a2a",
            Layer::Acp => "acp",
            Layer::Infrastructure => "infrastructure",
        };
        f.write_str(name)
    }
}

/// Message priority, ordered low to critical
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Recipient address
///
/// Serialized as `<kind>:<name>`, e.g. `agent:planner` or `session:abc-123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    Agent(String),
    Tool(String),
    Session(String),
    Topic(String),
}

impl Recipient {
    /// Name part of the address
    pub fn name(&self) -> &str {
        match self {
            Recipient::Agent(name)
            | Recipient::Tool(name)
            | Recipient::Session(name)
            | Recipient::Topic(name) => name,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Recipient::Agent(_) => "agent",
            Recipient::Tool(_) => "tool",
            Recipient::Session(_) => "session",
            Recipient::Topic(_) => "topic",
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

impl FromStr for Recipient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| format!("recipient '{s}' must have the form <kind>:<name>"))?;

        if name.trim().is_empty() {
            return Err(format!("recipient '{s}' has an empty name"));
        }

        let name = name.to_string();
        match kind {
            "agent" => Ok(Recipient::Agent(name)),
            "tool" => Ok(Recipient::Tool(name)),
            "session" => Ok(Recipient::Session(name)),
            "topic" => Ok(Recipient::Topic(name)),
            other => Err(format!("unknown recipient kind '{other}'")),
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.to_string()
    }
}

/// Payload of a `tool-request`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ToolRequestPayload {
    /// Registered tool capability name
    pub tool: String,
    /// Pin a specific capability version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Arguments validated against the capability input schema
    #[serde(default)]
    pub arguments: Value,
    /// Bearer token carrying the caller's scopes
    pub auth_token: String,
    /// Caller-supplied idempotency key; the message id is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Payload of a `tool-response`, also used by agents answering a delegation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ToolResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Payload of an `agent-direct` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DirectPayload {
    /// Session whose send order must be preserved
    pub session_id: String,
    /// Capability used to pick a substitute when the addressed agent is offline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Payload of a `capability-negotiation` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NegotiationPayload {
    pub agent_a: String,
    pub agent_b: String,
    /// Capabilities proposed for the collaboration; empty means "anything shared"
    #[serde(default)]
    pub proposed: Vec<String>,
}

/// Payload of a `task-delegation` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DelegationPayload {
    pub session_id: String,
    pub step_id: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub input: Value,
    /// Position within the session's ordered message lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Workflow control actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Pause,
    Resume,
    Cancel,
    Status,
}

/// Payload of a `workflow-control` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct WorkflowControlPayload {
    pub action: ControlAction,
    /// Registered workflow id to start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Inline workflow definition to define and start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Value>,
    /// Token used for tool steps of the started workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// Session management actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Open,
    Close,
    Status,
}

/// Payload of a `session-management` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct SessionPayload {
    pub action: SessionAction,
    /// Conversational context bound to the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

/// Error details carried by `error` envelopes and failed responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    /// Human-readable description (no sensitive data)
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Protocol error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SchemaError,
    ExpiredMessage,
    AuthenticationError,
    AuthorizationError,
    RateLimitExceeded,
    ApprovalTimeout,
    ApprovalRejected,
    NoAvailableInstance,
    NoCommonCapability,
    CircuitOpen,
    ToolInvocationFailed,
    WorkflowStepFailure,
    CyclicWorkflow,
    DuplicateRegistration,
    InvalidInput,
    InternalError,
}

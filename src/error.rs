//! Error taxonomy for the coordination protocol
//!
//! Every failure a layer service can surface is a variant of [`CoordError`].
//! Errors crossing the wire are mapped to an [`ErrorPayload`] with a protocol
//! [`ErrorCode`] and a sanitized message.

use crate::protocol::messages::{ErrorCode, ErrorPayload, Intent, ProtocolMessage};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Whether a tool invocation failure may succeed on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Main error type for coordination operations
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Schema error: {reason}")]
    Schema { reason: String },

    #[error("Message {message_id} expired at {expired_at}")]
    ExpiredMessage {
        message_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Actor '{actor}' is missing scopes: {}", missing_scopes.join(", "))]
    Authorization {
        actor: String,
        missing_scopes: Vec<String>,
    },

    #[error("Rate limit exceeded for '{actor}' on '{action}', retry after {retry_after:?}")]
    RateLimitExceeded {
        actor: String,
        action: String,
        retry_after: Duration,
    },

    #[error("Approval {approval_id} expired at {expired_at}")]
    ApprovalTimeout {
        approval_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    #[error("Approval {approval_id} was rejected")]
    ApprovalRejected { approval_id: Uuid },

    #[error("No available instance for capability '{capability}'")]
    NoAvailableInstance { capability: String },

    #[error("Agents '{agent_a}' and '{agent_b}' share no capability")]
    NoCommonCapability { agent_a: String, agent_b: String },

    #[error("Circuit open for {endpoint}, retry in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },

    #[error("Tool '{tool}' failed ({kind}): {message}")]
    ToolInvocation {
        tool: String,
        kind: FailureKind,
        message: String,
    },

    #[error("Step '{step_id}' of workflow '{workflow_id}' failed: {reason}")]
    WorkflowStepFailure {
        workflow_id: String,
        step_id: String,
        reason: String,
    },

    #[error("Workflow '{workflow_id}' contains a cycle through: {}", cycle.join(" -> "))]
    CyclicWorkflow {
        workflow_id: String,
        cycle: Vec<String>,
    },

    #[error("Conflicting registration for {name}@{version} at {endpoint}")]
    DuplicateRegistration {
        name: String,
        version: String,
        endpoint: String,
    },

    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    #[error("Unknown workflow: {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Recovery did not finish within {limit:?}")]
    RecoveryTimeout { limit: Duration },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::workflow::store::StoreError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoordError {
    /// Only transient tool failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::ToolInvocation {
                kind: FailureKind::Transient,
                ..
            }
        )
    }

    /// Protocol error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordError::Schema { .. } => ErrorCode::SchemaError,
            CoordError::ExpiredMessage { .. } => ErrorCode::ExpiredMessage,
            CoordError::Authentication { .. } => ErrorCode::AuthenticationError,
            CoordError::Authorization { .. } => ErrorCode::AuthorizationError,
            CoordError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            CoordError::ApprovalTimeout { .. } => ErrorCode::ApprovalTimeout,
            CoordError::ApprovalRejected { .. } => ErrorCode::ApprovalRejected,
            CoordError::NoAvailableInstance { .. } => ErrorCode::NoAvailableInstance,
            CoordError::NoCommonCapability { .. } => ErrorCode::NoCommonCapability,
            CoordError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            CoordError::ToolInvocation { .. } => ErrorCode::ToolInvocationFailed,
            CoordError::WorkflowStepFailure { .. } => ErrorCode::WorkflowStepFailure,
            CoordError::CyclicWorkflow { .. } => ErrorCode::CyclicWorkflow,
            CoordError::DuplicateRegistration { .. } => ErrorCode::DuplicateRegistration,
            CoordError::UnknownSession { .. }
            | CoordError::UnknownWorkflow { .. }
            | CoordError::InvalidInput { .. } => ErrorCode::InvalidInput,
            CoordError::RecoveryTimeout { .. }
            | CoordError::Config(_)
            | CoordError::Storage(_)
            | CoordError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Convert to the wire error payload published in `error` envelopes
    pub fn to_error_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: sanitize_error_message(&self.to_string()),
            retryable: self.is_retryable(),
        }
    }

    /// Build the `error` envelope answering `cause`, addressed to its sender
    pub fn to_error_message(&self, cause: &ProtocolMessage, sender: &str) -> ProtocolMessage {
        let payload = serde_json::to_value(self.to_error_payload()).unwrap_or_default();
        cause.reply(Intent::Error, sender, payload)
    }

    pub fn schema<S: Into<String>>(reason: S) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    pub fn authentication<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn no_available_instance<S: Into<String>>(capability: S) -> Self {
        Self::NoAvailableInstance {
            capability: capability.into(),
        }
    }

    pub fn tool_invocation<T: Into<String>, M: Into<String>>(
        tool: T,
        kind: FailureKind,
        message: M,
    ) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unknown_session<S: Into<String>>(session_id: S) -> Self {
        Self::UnknownSession {
            session_id: session_id.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|bearer)[=:]\s*\S+").expect("valid regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid regex")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Strip secrets and sensitive paths, then bound the length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

/// Result type for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_invocations_retry() {
        assert!(CoordError::tool_invocation("t", FailureKind::Transient, "503").is_retryable());
        assert!(!CoordError::tool_invocation("t", FailureKind::Permanent, "400").is_retryable());
        assert!(!CoordError::schema("bad").is_retryable());
        assert!(!CoordError::authentication("expired").is_retryable());
        assert!(!CoordError::CircuitOpen {
            endpoint: "http://x".to_string(),
            retry_in: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CoordError::schema("x").code(), ErrorCode::SchemaError);
        assert_eq!(
            CoordError::no_available_instance("calendar").code(),
            ErrorCode::NoAvailableInstance
        );
        assert_eq!(
            CoordError::unknown_session("s").code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(
            CoordError::RecoveryTimeout {
                limit: Duration::from_secs(30)
            }
            .code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_payload_carries_retryable_flag() {
        let payload =
            CoordError::tool_invocation("email.send", FailureKind::Transient, "timeout")
                .to_error_payload();
        assert_eq!(payload.code, ErrorCode::ToolInvocationFailed);
        assert!(payload.retryable);
        assert!(payload.message.contains("email.send"));
    }

    #[test]
    fn test_error_message_answers_cause() {
        use crate::protocol::messages::Recipient;

        let cause = ProtocolMessage::new(
            Intent::ToolRequest,
            "planner",
            Recipient::Tool("email.send".to_string()),
            serde_json::json!({}),
        );
        let reply = CoordError::schema("bad payload").to_error_message(&cause, "agentmesh");
        assert_eq!(reply.intent, Intent::Error);
        assert_eq!(reply.metadata.recipient, Recipient::Agent("planner".to_string()));
        assert_eq!(reply.metadata.causation_id, Some(cause.id));
        assert_eq!(reply.payload["code"], "schema_error");
    }

    #[test]
    fn test_authorization_message_lists_scopes() {
        let error = CoordError::Authorization {
            actor: "planner".to_string(),
            missing_scopes: vec!["calendar:write".to_string(), "email:send".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Actor 'planner' is missing scopes: calendar:write, email:send"
        );
    }

    #[test]
    fn test_cycle_message() {
        let error = CoordError::CyclicWorkflow {
            workflow_id: "wf".to_string(),
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert!(error.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_error_message_sanitization() {
        let error =
            CoordError::internal("Failed to authenticate: password=secret123 token=abc456");
        let payload = error.to_error_payload();

        assert!(!payload.message.contains("secret123"));
        assert!(!payload.message.contains("abc456"));
        assert!(payload.message.contains("password=***"));
        assert!(payload.message.contains("token=***"));
    }

    #[test]
    fn test_sanitize_case_insensitive_and_colons() {
        let sanitized = sanitize_error_message("PASSWORD: secret123 Bearer:abc Key=xyz");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized =
            sanitize_error_message("Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}

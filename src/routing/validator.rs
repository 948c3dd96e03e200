//! Envelope validation
//!
//! A message is routable when it parses, names a known intent, carries a
//! well-formed sender, has not outlived its ttl, addresses a recipient kind
//! its intent accepts, and its payload matches the intent's schema.

use crate::error::{CoordError, CoordResult};
use crate::protocol::{is_valid_id, Layer, PayloadSchemas, ProtocolMessage};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Outcome of a successful validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub message_id: Uuid,
    pub layer: Layer,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MessageValidator {
    schemas: PayloadSchemas,
}

impl MessageValidator {
    pub fn new() -> CoordResult<Self> {
        Ok(Self {
            schemas: PayloadSchemas::compile()?,
        })
    }

    /// Deserialize a raw envelope. Missing fields and unknown intents are schema errors.
    pub fn parse(&self, envelope: Value) -> CoordResult<ProtocolMessage> {
        serde_json::from_value(envelope)
            .map_err(|e| CoordError::schema(format!("invalid envelope: {e}")))
    }

    pub fn validate(&self, message: &ProtocolMessage) -> CoordResult<ValidationResult> {
        self.validate_at(message, Utc::now())
    }

    /// Validate against an explicit clock reading
    pub fn validate_at(
        &self,
        message: &ProtocolMessage,
        now: DateTime<Utc>,
    ) -> CoordResult<ValidationResult> {
        let metadata = &message.metadata;

        if !is_valid_id(&metadata.sender) {
            return Err(CoordError::schema(format!(
                "sender '{}' is not a valid agent id",
                metadata.sender
            )));
        }

        if metadata.ttl == 0 {
            return Err(CoordError::schema("ttl must be positive"));
        }

        if message.is_expired_at(now) {
            return Err(CoordError::ExpiredMessage {
                message_id: message.id,
                expired_at: message.expires_at(),
            });
        }

        if !message.intent.accepts(&metadata.recipient) {
            return Err(CoordError::schema(format!(
                "intent {} cannot address {}",
                message.intent, metadata.recipient
            )));
        }

        self.schemas.validate(message.intent, &message.payload)?;

        Ok(ValidationResult {
            message_id: message.id,
            layer: message.intent.layer(),
            expires_at: message.expires_at(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Intent, Recipient};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn tool_request() -> ProtocolMessage {
        ProtocolMessage::new(
            Intent::ToolRequest,
            "planner",
            Recipient::Tool("calendar.create_event".to_string()),
            json!({"tool": "calendar.create_event", "auth_token": "t", "arguments": {}}),
        )
    }

    #[test]
    fn test_valid_message() {
        let validator = MessageValidator::new().unwrap();
        let message = tool_request();
        let result = validator.validate(&message).unwrap();
        assert_eq!(result.message_id, message.id);
        assert_eq!(result.layer, Layer::Mcp);
    }

    #[test]
    fn test_expired_message() {
        let validator = MessageValidator::new().unwrap();
        let message = tool_request().with_ttl(10);
        let later = message.metadata.created_at + ChronoDuration::seconds(11);
        assert!(matches!(
            validator.validate_at(&message, later),
            Err(CoordError::ExpiredMessage { .. })
        ));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let validator = MessageValidator::new().unwrap();
        assert!(matches!(
            validator.validate(&tool_request().with_ttl(0)),
            Err(CoordError::Schema { .. })
        ));
    }

    #[test]
    fn test_intent_must_match_recipient() {
        let validator = MessageValidator::new().unwrap();
        let mut message = tool_request();
        message.metadata.recipient = Recipient::Agent("writer".to_string());
        assert!(matches!(
            validator.validate(&message),
            Err(CoordError::Schema { .. })
        ));
    }

    #[test]
    fn test_payload_schema_enforced() {
        let validator = MessageValidator::new().unwrap();
        let mut message = tool_request();
        message.payload = json!({"arguments": {}});
        let err = validator.validate(&message).unwrap_err();
        assert!(err.to_string().contains("tool-request"));
    }

    #[test]
    fn test_bad_sender() {
        let validator = MessageValidator::new().unwrap();
        let mut message = tool_request();
        message.metadata.sender = "bad sender!".to_string();
        assert!(validator.validate(&message).is_err());
    }

    #[test]
    fn test_parse_unknown_intent() {
        let validator = MessageValidator::new().unwrap();
        let mut envelope = serde_json::to_value(tool_request()).unwrap();
        envelope["intent"] = json!("teleport");
        assert!(matches!(
            validator.parse(envelope),
            Err(CoordError::Schema { .. })
        ));
    }

    #[test]
    fn test_parse_missing_metadata() {
        let validator = MessageValidator::new().unwrap();
        let envelope = json!({
            "id": Uuid::new_v4(),
            "intent": "health-check",
            "priority": "normal",
        });
        assert!(validator.parse(envelope).is_err());
    }
}

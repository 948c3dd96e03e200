//! Payload schemas per intent
//!
//! Schemas are generated from the typed payloads with `schemars` and compiled
//! once with `jsonschema`. Intake validation checks every payload against the
//! compiled validator for its intent.

use super::messages::{
    DelegationPayload, DirectPayload, ErrorPayload, Intent, NegotiationPayload, SessionPayload,
    ToolRequestPayload, ToolResponsePayload, WorkflowControlPayload,
};
use crate::error::{CoordError, CoordResult};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// JSON Schema for an intent's payload, or `None` when the payload is free-form
pub fn payload_schema(intent: Intent) -> Option<Value> {
    let schema = match intent {
        Intent::ToolRequest => schemars::schema_for!(ToolRequestPayload),
        Intent::ToolResponse => schemars::schema_for!(ToolResponsePayload),
        Intent::AgentDirect => schemars::schema_for!(DirectPayload),
        Intent::CapabilityNegotiation => schemars::schema_for!(NegotiationPayload),
        Intent::TaskDelegation => schemars::schema_for!(DelegationPayload),
        Intent::WorkflowControl => schemars::schema_for!(WorkflowControlPayload),
        Intent::SessionManagement => schemars::schema_for!(SessionPayload),
        Intent::Error => schemars::schema_for!(ErrorPayload),
        Intent::HealthCheck => return None,
    };
    serde_json::to_value(schema).ok()
}

/// All payload schemas keyed by intent name
pub fn all_payload_schemas() -> Value {
    let mut schemas = Map::new();
    for intent in Intent::ALL {
        if let Some(schema) = payload_schema(intent) {
            schemas.insert(intent.as_str().to_string(), schema);
        }
    }
    Value::Object(schemas)
}

/// Compiled payload validators
pub struct PayloadSchemas {
    validators: HashMap<Intent, jsonschema::Validator>,
}

impl PayloadSchemas {
    /// Compile validators for every intent that has a payload schema
    pub fn compile() -> CoordResult<Self> {
        let mut validators = HashMap::new();
        for intent in Intent::ALL {
            let Some(schema) = payload_schema(intent) else {
                continue;
            };
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                CoordError::internal(format!("payload schema for {intent} does not compile: {e}"))
            })?;
            validators.insert(intent, validator);
        }
        Ok(Self { validators })
    }

    /// Check a payload against its intent's schema
    pub fn validate(&self, intent: Intent, payload: &Value) -> CoordResult<()> {
        let Some(validator) = self.validators.get(&intent) else {
            return Ok(());
        };

        validator.validate(payload).map_err(|errors| {
            let messages: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            CoordError::schema(format!("{intent} payload: {}", messages.join("; ")))
        })
    }
}

impl std::fmt::Debug for PayloadSchemas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSchemas")
            .field("intents", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Compile a caller-supplied schema, such as a tool's input schema
pub fn compile_schema(schema: &Value) -> CoordResult<jsonschema::Validator> {
    jsonschema::validator_for(schema)
        .map_err(|e| CoordError::invalid_input(format!("Schema compilation error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_schema_compiles() {
        let schemas = PayloadSchemas::compile().unwrap();
        assert_eq!(schemas.validators.len(), Intent::ALL.len() - 1);
    }

    #[test]
    fn test_tool_request_payload() {
        let schemas = PayloadSchemas::compile().unwrap();
        let valid = json!({"tool": "calendar.create_event", "auth_token": "abc"});
        assert!(schemas.validate(Intent::ToolRequest, &valid).is_ok());

        let missing_tool = json!({"auth_token": "abc"});
        let err = schemas
            .validate(Intent::ToolRequest, &missing_tool)
            .unwrap_err();
        assert!(matches!(err, CoordError::Schema { .. }));
        assert!(err.to_string().contains("tool-request"));
    }

    #[test]
    fn test_workflow_control_action_enum() {
        let schemas = PayloadSchemas::compile().unwrap();
        assert!(schemas
            .validate(Intent::WorkflowControl, &json!({"action": "pause"}))
            .is_ok());
        assert!(schemas
            .validate(Intent::WorkflowControl, &json!({"action": "explode"}))
            .is_err());
    }

    #[test]
    fn test_health_check_is_free_form() {
        let schemas = PayloadSchemas::compile().unwrap();
        assert!(schemas
            .validate(Intent::HealthCheck, &json!("anything"))
            .is_ok());
    }

    #[test]
    fn test_all_payload_schemas_listing() {
        let schemas = all_payload_schemas();
        assert!(schemas["tool-request"]["properties"]["tool"].is_object());
        assert!(schemas.get("health-check").is_none());
    }
}

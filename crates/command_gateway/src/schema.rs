//! The homework-command schema gate.
//!
//! Commands are validated against a fixed JSON schema before any side effect
//! occurs. Device-command and presence payloads are deliberately not
//! validated; they are loosely-typed control messages from deployed
//! publishers.

use desklink_domain::{DomainError, DomainResult};
use jsonschema::Validator;

const HOMEWORK_COMMAND_SCHEMA: &str = include_str!("../schemas/homework_command.v1.json");

/// Compiled validator for the homework-command payload shape.
pub struct HomeworkCommandValidator {
    validator: Validator,
}

impl HomeworkCommandValidator {
    /// Compile the embedded schema. Only fails if the shipped schema itself
    /// is broken.
    pub fn new() -> DomainResult<Self> {
        let schema: serde_json::Value = serde_json::from_str(HOMEWORK_COMMAND_SCHEMA)
            .map_err(|e| DomainError::SchemaValidationFailed(format!("invalid schema JSON: {}", e)))?;
        let validator = Validator::new(&schema)
            .map_err(|e| DomainError::SchemaValidationFailed(format!("invalid schema: {}", e)))?;
        Ok(Self { validator })
    }

    /// Validate a parsed payload, collecting every violation into the error
    /// detail.
    pub fn validate(&self, payload: &serde_json::Value) -> DomainResult<()> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(payload)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::SchemaValidationFailed(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_command() -> serde_json::Value {
        json!({
            "action": "start",
            "academy_id": "A1",
            "student_id": "S1",
            "item_id": "I1",
            "idempotency_key": "K1",
            "at": "2024-01-01T00:00:00Z",
        })
    }

    #[test]
    fn test_valid_command_passes() {
        let validator = HomeworkCommandValidator::new().unwrap();
        assert!(validator.validate(&valid_command()).is_ok());
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let validator = HomeworkCommandValidator::new().unwrap();
        let payload = json!({
            "action": "complete",
            "academy_id": "A1",
            "item_id": "I1",
            "at": "2024-01-01T00:00:00Z",
        });
        assert!(validator.validate(&payload).is_ok());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let validator = HomeworkCommandValidator::new().unwrap();
        let mut payload = valid_command();
        payload.as_object_mut().unwrap().remove("item_id");

        let result = validator.validate(&payload);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("item_id"));
    }

    #[test]
    fn test_unknown_action_fails() {
        let validator = HomeworkCommandValidator::new().unwrap();
        let mut payload = valid_command();
        payload["action"] = json!("restart");

        assert!(validator.validate(&payload).is_err());
    }

    #[test]
    fn test_wrong_type_fails() {
        let validator = HomeworkCommandValidator::new().unwrap();
        let mut payload = valid_command();
        payload["academy_id"] = json!(42);

        assert!(validator.validate(&payload).is_err());
    }

    #[test]
    fn test_non_object_fails() {
        let validator = HomeworkCommandValidator::new().unwrap();
        assert!(validator.validate(&json!("start")).is_err());
        assert!(validator.validate(&json!(null)).is_err());
    }

    #[test]
    fn test_extra_fields_are_tolerated() {
        // Deployed publishers attach extra metadata; the gate must not
        // reject currently-accepted shapes.
        let validator = HomeworkCommandValidator::new().unwrap();
        let mut payload = valid_command();
        payload["client_version"] = json!("2.3.1");

        assert!(validator.validate(&payload).is_ok());
    }
}

//! Schema validator (§4.I): JSON Schema Draft 2020-12, the feature subset
//! named in the design (`type`, `properties`, `required`, `items`, `enum`,
//! `const`, `oneOf`, `anyOf`, `pattern`, `format`, `additionalProperties`).
//! Strict mode is whatever the schema itself declares
//! (`additionalProperties: false` rejects unknown keys; `format` checks for
//! `date-time`/`uri`/`email` are opt-in per the underlying `jsonschema`
//! crate's format validation).

use cadence_kernel::{KernelError, Value};
use jsonschema::{Draft, JSONSchema};

pub struct SchemaValidator {
    compiled: JSONSchema,
}

impl SchemaValidator {
    pub fn compile(schema: &Value) -> Result<Self, KernelError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(schema)
            .map_err(|e| KernelError::SchemaViolation(format!("invalid schema document: {e}")))?;
        Ok(Self { compiled })
    }

    /// Validates `instance`, collecting every violation into a single
    /// bounded-size error summary (§7 "each terminal run has ... a
    /// bounded-size error summary").
    pub fn validate(&self, instance: &Value) -> Result<(), KernelError> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors.take(8).map(|e| e.to_string()).collect();
                Err(KernelError::SchemaViolation(messages.join("; ")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_required_property() {
        let schema = json!({
            "type": "object",
            "properties": {"value": {"type": "integer"}},
            "required": ["value"],
            "additionalProperties": false
        });
        let validator = SchemaValidator::compile(&schema).unwrap();
        let err = validator.validate(&json!({})).unwrap_err();
        assert!(matches!(err, KernelError::SchemaViolation(_)));
    }

    #[test]
    fn rejects_unknown_property_in_strict_mode() {
        let schema = json!({
            "type": "object",
            "properties": {"value": {"type": "integer"}},
            "additionalProperties": false
        });
        let validator = SchemaValidator::compile(&schema).unwrap();
        assert!(validator.validate(&json!({"value": 1, "extra": true})).is_err());
    }

    #[test]
    fn accepts_well_formed_instance() {
        let schema = json!({
            "type": "object",
            "properties": {"value": {"type": "integer"}},
            "required": ["value"]
        });
        let validator = SchemaValidator::compile(&schema).unwrap();
        assert!(validator.validate(&json!({"value": 42})).is_ok());
    }
}

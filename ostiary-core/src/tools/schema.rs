//! JSON Schema compilation and validation for tool contracts

use super::result::{ErrorCode, ToolError, ValidationError};
use jsonschema::{Draft, Validator};
use serde_json::Value;

/// A compiled JSON Schema (draft 2020-12)
pub struct CompiledSchema {
    validator: Validator,
}

impl CompiledSchema {
    /// Compile a schema.
    ///
    /// An uncompilable schema is a contract violation of the definition
    /// itself and is reported as `TOOL_SCHEMA_VIOLATION`.
    pub fn compile(schema: &Value) -> Result<Self, ToolError> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|err| {
                ToolError::new(
                    ErrorCode::ToolSchemaViolation,
                    format!("invalid schema: {err}"),
                )
            })?;
        Ok(Self { validator })
    }

    /// Validate an instance, collecting every violation
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<ValidationError>> {
        let errors: Vec<ValidationError> = self
            .validator
            .iter_errors(instance)
            .map(|err| ValidationError::new("", err.to_string()))
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Check validity without collecting errors
    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").finish_non_exhaustive()
    }
}

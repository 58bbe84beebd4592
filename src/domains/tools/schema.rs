//! Input/output schemas and argument validation.
//!
//! Schemas are JSON Schema objects compiled once at load time. Validation
//! never fails hard: malformed input is reported as a list of field-level
//! [`Violation`]s.

use jsonschema::JSONSchema;
use jsonschema::error::ValidationErrorKind;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt;

/// Why a field failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    Missing,
    Type,
    Enum,
    Invalid,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Missing => "missing",
            Self::Type => "wrong type",
            Self::Enum => "not an allowed value",
            Self::Invalid => "invalid",
        };
        f.write_str(label)
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Dotted path of the offending field; empty for the arguments object itself.
    pub field: String,
    pub reason: ViolationReason,
    pub message: String,
}

/// Outcome of validating a set of arguments.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Names of every offending field.
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

/// Compiled input and output schemas for one tool.
pub struct ToolSchema {
    input: Value,
    output: Value,
    input_validator: JSONSchema,
    output_validator: JSONSchema,
}

impl fmt::Debug for ToolSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSchema")
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

impl ToolSchema {
    /// Compile a pair of schemas.
    ///
    /// The input schema must describe an object, since tool arguments are
    /// always a JSON object.
    pub fn compile(input: Value, output: Value) -> Result<Self, String> {
        let input = strip_meta_schema(input);
        let output = strip_meta_schema(output);

        if !input.is_object() {
            return Err("input schema must be a JSON object".to_string());
        }
        if let Some(ty) = input.get("type") {
            if ty != "object" {
                return Err(format!("input schema must have type \"object\", found {}", ty));
            }
        }

        let input_validator =
            JSONSchema::compile(&input).map_err(|e| format!("input schema: {}", e))?;
        let output_validator =
            JSONSchema::compile(&output).map_err(|e| format!("output schema: {}", e))?;

        Ok(Self {
            input,
            output,
            input_validator,
            output_validator,
        })
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn output(&self) -> &Value {
        &self.output
    }

    /// Check arguments against the input schema.
    pub fn validate(&self, args: &Map<String, Value>) -> ValidationReport {
        let instance = Value::Object(args.clone());
        let violations = match self.input_validator.validate(&instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let path = pointer_to_field(&error.instance_path.to_string());
                    let (field, reason) = match &error.kind {
                        ValidationErrorKind::Required { property } => {
                            let property = property.as_str().unwrap_or_default();
                            let field = if path.is_empty() {
                                property.to_string()
                            } else {
                                format!("{}.{}", path, property)
                            };
                            (field, ViolationReason::Missing)
                        }
                        ValidationErrorKind::Type { .. } => (path, ViolationReason::Type),
                        ValidationErrorKind::Enum { .. } => (path, ViolationReason::Enum),
                        _ => (path, ViolationReason::Invalid),
                    };
                    Violation {
                        field,
                        reason,
                        message: error.to_string(),
                    }
                })
                .collect(),
        };
        ValidationReport { violations }
    }

    /// Check a result against the output schema, returning a joined message on mismatch.
    pub fn check_output(&self, result: &Value) -> Result<(), String> {
        match self.output_validator.validate(result) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")),
        }
    }
}

pub fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

pub fn default_output_schema() -> Value {
    json!({})
}

/// Generated schemas carry a `$schema` draft marker the validator does not need.
fn strip_meta_schema(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
    }
    schema
}

fn pointer_to_field(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

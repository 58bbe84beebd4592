//! Tool-specific error types.
//!
//! Three families live here:
//! - [`LoadError`]: a descriptor or plugin could not be turned into a live
//!   tool instance. Non-fatal; the hot-reload loop retries on its next tick.
//! - [`ExecutionError`]: a tool's own logic failed. Returned as a value,
//!   counted against the tool, never propagated as a crash.
//! - [`DispatchError`]: everything the protocol dispatcher can answer with,
//!   each variant carrying its JSON-RPC error code.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::schema::Violation;

// ============================================================================
// Load errors
// ============================================================================

/// Errors raised while reading descriptors or instantiating tools.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The descriptor store or a plugin source could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The descriptor file is not valid JSON or misses required fields.
    #[error("Failed to parse descriptor {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The descriptor parsed but violates a field rule.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The implementation locator does not name a known loader strategy.
    #[error("Unknown implementation locator '{0}'")]
    UnknownLocator(String),

    /// The tool's input or output schema could not be compiled.
    #[error("Invalid schema for tool '{tool}': {message}")]
    Schema { tool: String, message: String },

    /// The loader resolved the locator but construction failed.
    #[error("Failed to instantiate tool '{tool}': {message}")]
    Instantiate { tool: String, message: String },

    /// Another descriptor file already owns this tool name.
    #[error("Tool name '{name}' is already provided by {owner}")]
    NameConflict { name: String, owner: PathBuf },
}

impl LoadError {
    /// Create an I/O error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a parse error for the given path.
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an "invalid descriptor" error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create a schema error.
    pub fn schema(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an instantiation error.
    pub fn instantiate(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instantiate {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Execution errors
// ============================================================================

/// Category of a tool execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The tool could not reach its upstream.
    Network,
    /// The upstream answered with an error status.
    Upstream,
    /// The upstream answer could not be parsed.
    Parse,
    /// The tool produced a result that does not match its output schema.
    InvalidOutput,
    /// Any other failure reported by the tool itself.
    Failed,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network failure",
            Self::Upstream => "upstream error",
            Self::Parse => "parse failure",
            Self::InvalidOutput => "invalid output",
            Self::Failed => "execution failed",
        };
        f.write_str(label)
    }
}

/// A categorized failure returned by [`Tool::execute`](super::Tool::execute).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub data: Option<Value>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Network, message)
    }

    /// An upstream error status, recorded in `data.status`.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Upstream, message).with_data(json!({ "status": status }))
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Parse, message)
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::InvalidOutput, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Failed, message)
    }

    /// Attach tool-supplied detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ============================================================================
// Dispatch errors
// ============================================================================

/// JSON-RPC error codes used by the dispatcher.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const TOOL_NOT_FOUND: i32 = -32001;
    pub const UNAUTHORIZED: i32 = -32002;
    pub const VALIDATION_FAILED: i32 = -32003;
    pub const EXECUTION_FAILED: i32 = -32004;
    pub const TIMEOUT: i32 = -32005;
}

/// Every error the protocol dispatcher can encode into a response.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request body is not JSON at all.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The envelope is malformed (missing method, non-object params, ...).
    #[error("Invalid request: {0}")]
    Protocol(String),

    /// The method is not one the dispatcher serves.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Method parameters are missing or have the wrong shape.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// No enabled tool is registered under this name.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The caller may not use the requested tool.
    #[error("Caller '{identity}' is not authorized for tool '{tool}'")]
    Unauthorized { identity: String, tool: String },

    /// Arguments failed the tool's input schema.
    #[error("Invalid arguments for tool '{tool}': {}", summarize(.violations))]
    Validation {
        tool: String,
        violations: Vec<Violation>,
    },

    /// The tool ran and reported a failure.
    #[error("Tool '{tool}' failed: {source}")]
    Execution {
        tool: String,
        #[source]
        source: ExecutionError,
    },

    /// The tool did not finish before its deadline.
    #[error("Tool '{tool}' timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// A fault inside the registry or dispatcher itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.field, v.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DispatchError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an "invalid params" error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create a "tool not found" error.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::Protocol(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::ToolNotFound(_) => codes::TOOL_NOT_FOUND,
            Self::Unauthorized { .. } => codes::UNAUTHORIZED,
            Self::Validation { .. } => codes::VALIDATION_FAILED,
            Self::Execution { .. } => codes::EXECUTION_FAILED,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Structured detail for the error envelope's `data` field.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::ToolNotFound(name) => Some(json!({ "tool": name })),
            Self::Unauthorized { tool, .. } => Some(json!({ "tool": tool })),
            Self::Validation { tool, violations } => Some(json!({
                "tool": tool,
                "violations": violations,
            })),
            Self::Execution { tool, source } => Some(json!({
                "tool": tool,
                "kind": source.kind,
                "detail": source.data,
            })),
            Self::Timeout { tool, timeout_ms } => Some(json!({
                "tool": tool,
                "timeout_ms": timeout_ms,
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::tools::schema::ViolationReason;

    #[test]
    fn test_codes_are_distinct_per_class() {
        let errors = [
            DispatchError::Parse("x".into()),
            DispatchError::protocol("x"),
            DispatchError::MethodNotFound("x".into()),
            DispatchError::invalid_params("x"),
            DispatchError::tool_not_found("x"),
            DispatchError::Unauthorized {
                identity: "a".into(),
                tool: "b".into(),
            },
            DispatchError::Validation {
                tool: "x".into(),
                violations: vec![],
            },
            DispatchError::Execution {
                tool: "x".into(),
                source: ExecutionError::failed("boom"),
            },
            DispatchError::Timeout {
                tool: "x".into(),
                timeout_ms: 1,
            },
            DispatchError::internal("x"),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_validation_message_lists_fields() {
        let err = DispatchError::Validation {
            tool: "echo".into(),
            violations: vec![Violation {
                field: "text".into(),
                reason: ViolationReason::Missing,
                message: "\"text\" is a required property".into(),
            }],
        };
        assert!(err.to_string().contains("text (missing)"));
        let data = err.data().unwrap();
        assert_eq!(data["violations"][0]["field"], "text");
    }

    #[test]
    fn test_upstream_error_carries_status() {
        let err = ExecutionError::upstream(503, "service unavailable");
        assert_eq!(err.kind, ExecutionErrorKind::Upstream);
        assert_eq!(err.data.unwrap()["status"], 503);
    }
}

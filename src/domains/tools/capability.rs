//! The capability interface every tool plugin satisfies.
//!
//! How a tool's code was obtained (native, subprocess script, REST
//! template, SQL query) is decided by the loader and invisible past this
//! trait: the registry and dispatcher only ever see `Arc<dyn Tool>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::descriptor::ToolDescriptor;
use super::error::ExecutionError;
use super::schema::{ToolSchema, ValidationReport};

/// Tool arguments: always a JSON object.
pub type JsonObject = Map<String, Value>;

/// A live tool instance shared between the registry and in-flight calls.
pub type SharedTool = Arc<dyn Tool>;

/// The closed set of implementation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Native,
    Script,
    Rest,
    DbQuery,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Script => "script",
            Self::Rest => "rest",
            Self::DbQuery => "db_query",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract implemented by every tool.
///
/// `execute` may be called concurrently on the same instance; any state it
/// keeps across calls must be synchronized by the implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The descriptor this instance was built from.
    fn describe(&self) -> Arc<ToolDescriptor>;

    /// Which loader strategy produced this instance.
    fn kind(&self) -> ToolKind;

    /// Compiled input/output schemas.
    fn schema(&self) -> &ToolSchema;

    fn input_schema(&self) -> &Value {
        self.schema().input()
    }

    fn output_schema(&self) -> &Value {
        self.schema().output()
    }

    /// Check arguments against the input schema. Never panics on malformed input.
    fn validate(&self, args: &JsonObject) -> ValidationReport {
        self.schema().validate(args)
    }

    /// Perform the tool's work.
    async fn execute(&self, args: JsonObject) -> Result<Value, ExecutionError>;
}

/// The descriptor and schema pair every concrete tool carries.
#[derive(Debug)]
pub struct ToolCore {
    pub descriptor: Arc<ToolDescriptor>,
    pub schema: ToolSchema,
}

impl ToolCore {
    pub fn new(descriptor: Arc<ToolDescriptor>, schema: ToolSchema) -> Self {
        Self { descriptor, schema }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

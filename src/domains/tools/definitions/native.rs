//! Native tools compiled into the host.
//!
//! The catalog is closed: a `native:<name>` locator can only name a tool
//! listed in [`NativeCatalog::builtin`].

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domains::tools::capability::{JsonObject, Tool, ToolCore, ToolKind};
use crate::domains::tools::descriptor::ToolDescriptor;
use crate::domains::tools::error::ExecutionError;
use crate::domains::tools::schema::{ToolSchema, default_input_schema};

/// Future returned by a native handler.
pub type NativeFuture = BoxFuture<'static, Result<Value, ExecutionError>>;

/// Entry point of a native tool.
pub type NativeHandler = fn(JsonObject) -> NativeFuture;

/// Static description of one native tool.
#[derive(Clone, Copy)]
pub struct NativeSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub handler: NativeHandler,
    /// Input schema used when the descriptor declares none.
    pub input_schema: fn() -> Value,
}

/// The statically known set of native tools.
#[derive(Clone)]
pub struct NativeCatalog {
    specs: BTreeMap<&'static str, NativeSpec>,
}

impl NativeCatalog {
    /// An empty catalog.
    pub fn empty() -> Self {
        Self {
            specs: BTreeMap::new(),
        }
    }

    /// The catalog shipped with the host.
    pub fn builtin() -> Self {
        Self::empty()
            .with(EchoTool::spec())
            .with(DelayTool::spec())
    }

    pub fn with(mut self, spec: NativeSpec) -> Self {
        self.specs.insert(spec.name, spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&NativeSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

impl Default for NativeCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A tool instance backed by a native handler.
pub struct NativeTool {
    core: ToolCore,
    handler: NativeHandler,
}

impl NativeTool {
    pub fn new(descriptor: Arc<ToolDescriptor>, schema: ToolSchema, handler: NativeHandler) -> Self {
        Self {
            core: ToolCore::new(descriptor, schema),
            handler,
        }
    }
}

#[async_trait]
impl Tool for NativeTool {
    fn describe(&self) -> Arc<ToolDescriptor> {
        self.core.descriptor.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Native
    }

    fn schema(&self) -> &ToolSchema {
        &self.core.schema
    }

    async fn execute(&self, args: JsonObject) -> Result<Value, ExecutionError> {
        (self.handler)(args).await
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| default_input_schema())
}

fn parse_args<T: DeserializeOwned>(args: JsonObject) -> Result<T, ExecutionError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| ExecutionError::failed(format!("invalid arguments: {}", e)))
}

// ============================================================================
// echo
// ============================================================================

/// Parameters for the echo tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EchoParams {
    /// Text to send back.
    pub text: String,
}

/// Echo tool - returns its input text.
pub struct EchoTool;

impl EchoTool {
    pub const NAME: &'static str = "echo";

    pub const DESCRIPTION: &'static str = "Return the given text unchanged.";

    pub fn spec() -> NativeSpec {
        NativeSpec {
            name: Self::NAME,
            description: Self::DESCRIPTION,
            handler: Self::handle,
            input_schema: schema_of::<EchoParams>,
        }
    }

    fn handle(args: JsonObject) -> NativeFuture {
        async move {
            let params: EchoParams = parse_args(args)?;
            Ok(json!({ "text": params.text }))
        }
        .boxed()
    }
}

// ============================================================================
// delay
// ============================================================================

/// Parameters for the delay tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DelayParams {
    /// How long to sleep, in milliseconds.
    pub ms: u64,
}

/// Delay tool - sleeps before answering. Handy for exercising deadlines.
pub struct DelayTool;

impl DelayTool {
    pub const NAME: &'static str = "delay";

    pub const DESCRIPTION: &'static str = "Sleep for the given number of milliseconds, then return.";

    pub fn spec() -> NativeSpec {
        NativeSpec {
            name: Self::NAME,
            description: Self::DESCRIPTION,
            handler: Self::handle,
            input_schema: schema_of::<DelayParams>,
        }
    }

    fn handle(args: JsonObject) -> NativeFuture {
        async move {
            let params: DelayParams = parse_args(args)?;
            debug!("Sleeping for {} ms", params.ms);
            tokio::time::sleep(Duration::from_millis(params.ms)).await;
            Ok(json!({ "slept_ms": params.ms }))
        }
        .boxed()
    }
}

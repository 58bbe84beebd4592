//! MCP Server implementation and lifecycle management.
//!
//! This module bridges MCP sessions (stdio, tcp) onto the tool runtime.
//! `tools/list` and `tools/call` go through the same dispatcher as the
//! HTTP JSON-RPC methods, so validation, authorization, deadlines and
//! metrics behave identically whichever transport a caller uses.
//!
//! Tools are not compiled in: the list is whatever the registry holds at
//! the moment of the request.

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::RequestContext,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

use super::config::Config;
use super::error::Result;
use crate::domains::tools::Tool as _;
use crate::domains::tools::{
    DispatchError, Dispatcher, Invocation, ListFilter, RegistryEntry, ToolRuntime,
};

/// The main MCP server handler.
///
/// Cheap to clone: the TCP transport hands one clone to every connection.
#[derive(Clone)]
pub struct McpServer {
    /// Server configuration.
    config: Arc<Config>,

    /// Registry, reload manager and dispatcher.
    runtime: ToolRuntime,
}

impl McpServer {
    /// Create a new MCP server, building the tool runtime from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let runtime = ToolRuntime::from_config(&config)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a server around an existing runtime.
    pub fn with_runtime(config: Config, runtime: ToolRuntime) -> Self {
        Self {
            config: Arc::new(config),
            runtime,
        }
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.server.name
    }

    /// Get the server version.
    pub fn version(&self) -> &str {
        &self.config.server.version
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn runtime(&self) -> &ToolRuntime {
        &self.runtime
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.runtime.dispatcher()
    }
}

/// MCP view of a registry entry.
pub(crate) fn to_mcp_tool(entry: &RegistryEntry) -> Tool {
    let descriptor = entry.descriptor();
    let description = descriptor
        .description
        .clone()
        .unwrap_or_else(|| format!("{} v{}", descriptor.name, descriptor.version));
    let input_schema = match entry.instance().input_schema() {
        Value::Object(map) => map.clone(),
        _ => JsonObject::new(),
    };
    Tool::new(descriptor.name.clone(), description, Arc::new(input_schema))
}

/// Execution failures and timeouts are tool results flagged as errors;
/// everything else is a protocol error carrying the dispatcher's code.
pub(crate) fn to_call_result(
    result: std::result::Result<Invocation, DispatchError>,
) -> std::result::Result<CallToolResult, McpError> {
    match result {
        Ok(invocation) => {
            let text = match &invocation.output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(e @ (DispatchError::Execution { .. } | DispatchError::Timeout { .. })) => {
            Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
        }
        Err(e) => Err(McpError::new(ErrorCode(e.code()), e.to_string(), e.data())),
    }
}

impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Tool runtime server. Tools are loaded from descriptors and reloaded \
                 without restart; list them to see what is currently available."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    #[instrument(skip(self, _context))]
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        let tools: Vec<Tool> = self
            .dispatcher()
            .list(&ListFilter::default())
            .iter()
            .map(|entry| to_mcp_tool(entry))
            .collect();
        info!("Listing {} tools", tools.len());
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        })
    }

    #[instrument(skip(self, request, _context), fields(tool = %request.name))]
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        let result = self
            .dispatcher()
            .invoke(
                &request.name,
                arguments,
                None,
                self.runtime.default_identity(),
            )
            .await;
        to_call_result(result)
    }
}

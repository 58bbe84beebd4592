//! STDIO transport implementation.
//!
//! A single MCP session over stdin/stdout - the default mode.

use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{TransportError, TransportResult};
use crate::core::McpServer;

/// STDIO transport handler.
pub struct StdioTransport;

impl StdioTransport {
    /// Run the session until stdin closes or `shutdown` fires.
    pub async fn run(server: McpServer, shutdown: CancellationToken) -> TransportResult<()> {
        info!(
            "Ready - serving {} tool(s) via stdin/stdout",
            server.runtime().registry().len()
        );

        let service = server
            .serve_with_ct(rmcp::transport::stdio(), shutdown.child_token())
            .await
            .map_err(|e| TransportError::session_init(e.to_string()))?;

        let reason = service
            .waiting()
            .await
            .map_err(|e| TransportError::session(e.to_string()))?;

        info!("STDIO session finished: {:?}", reason);
        Ok(())
    }
}

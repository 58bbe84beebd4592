//! Tool Runtime Server Library
//!
//! An extensible tool-execution host. Tools are declared by JSON
//! descriptors, instantiated by a closed set of loaders (native, script,
//! REST template, SQL query), kept live in a concurrent registry,
//! hot-reloaded when their sources change, and invoked through a JSON-RPC
//! dispatcher that validates arguments, checks authorization and enforces
//! deadlines.
//!
//! # Architecture
//!
//! - **core**: Configuration, error handling, security, the MCP session bridge and transports
//! - **domains**: Business logic organized by bounded contexts
//!   - **tools**: Descriptors, loaders, registry, hot reload and the dispatcher
//!
//! # Example
//!
//! ```rust,no_run
//! use tool_runtime_server::core::{Config, McpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     let server = McpServer::new(config)?;
//!     server.runtime().load().await?;
//!     // Serve it with a TransportService...
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod domains;

// Re-export commonly used types for convenience
pub use core::{Config, Error, McpServer, Result};
pub use domains::tools::ToolRuntime;

//! Tools domain module.
//!
//! Tools are loaded from JSON descriptors, kept live in a registry, swapped
//! in place when their sources change, and invoked through a JSON-RPC
//! dispatcher.
//!
//! ## Architecture
//!
//! - `descriptor.rs` - Descriptor format and the on-disk descriptor store
//! - `schema.rs` - Compiled input/output schemas and argument validation
//! - `capability.rs` - The `Tool` trait every plugin implements
//! - `definitions/` - One implementation strategy per file (native, script, rest, db)
//! - `loader.rs` - Locator parsing and instance construction
//! - `registry.rs` - Name to live instance map with generations and metrics
//! - `reload.rs` - Hot-reload loop over the descriptor store
//! - `dispatcher.rs` - JSON-RPC methods over the registry
//! - `runtime.rs` - Wiring of all the above from configuration
//! - `error.rs` - Load, execution and dispatch errors
//!
//! ## Adding a Tool
//!
//! Drop a descriptor into the descriptor directory:
//!
//! ```json
//! { "name": "echo", "implementation_locator": "native:echo", "version": "1.0.0" }
//! ```
//!
//! The next reload tick picks it up. No restart is needed.

pub mod capability;
pub mod definitions;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod loader;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod schema;

pub use capability::{JsonObject, SharedTool, Tool, ToolKind};
pub use descriptor::{DescriptorStore, ToolDescriptor, ToolMetadata};
pub use dispatcher::{DispatchSettings, Dispatcher, Invocation, Method, RpcRequest, RpcResponse};
pub use error::{DispatchError, ExecutionError, ExecutionErrorKind, LoadError};
pub use loader::{ImplementationLocator, ToolLoader};
pub use registry::{ListFilter, MetricsSnapshot, RegistryEntry, ToolMetrics, ToolRegistry};
pub use reload::{
    ChangeKind, HotReloadManager, ReloadEvent, ReloadPhase, ReloadSettings, TickReport,
};
pub use runtime::ToolRuntime;
pub use schema::{ToolSchema, ValidationReport, Violation};

//! Tool definitions module.
//!
//! One file per implementation strategy. The loader picks among these from
//! a descriptor's implementation locator.

pub mod db;
pub mod native;
pub mod rest;
pub mod script;

pub use db::DbQueryTool;
pub use native::{DelayTool, EchoTool, NativeCatalog, NativeHandler, NativeSpec, NativeTool};
pub use rest::{RestTemplate, RestTool};
pub use script::ScriptTool;

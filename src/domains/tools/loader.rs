//! Turning descriptors into live tool instances.
//!
//! The set of loadable kinds is closed: every `implementation_locator` is
//! parsed into an [`ImplementationLocator`] and handed to the matching
//! strategy. Nothing is resolved by name at runtime beyond the static
//! native catalog.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::capability::{SharedTool, ToolKind};
use super::definitions::{DbQueryTool, NativeCatalog, NativeTool, RestTemplate, RestTool, ScriptTool};
use super::descriptor::ToolDescriptor;
use super::error::LoadError;
use super::schema::{ToolSchema, default_input_schema, default_output_schema};
use crate::core::config::SecurityConfig;
use crate::core::security::validate_path;

/// A parsed `implementation_locator`.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplementationLocator {
    /// `native:<name>`
    Native(String),
    /// `script:<path relative to the descriptor>`
    Script(PathBuf),
    /// `rest:<METHOD> <url template>`
    Rest(String),
    /// `db:<sqlite url>`
    Db(String),
}

impl ImplementationLocator {
    pub fn parse(locator: &str) -> Result<Self, LoadError> {
        let (scheme, rest) = locator
            .split_once(':')
            .ok_or_else(|| LoadError::UnknownLocator(locator.to_string()))?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(LoadError::UnknownLocator(locator.to_string()));
        }
        match scheme.trim() {
            "native" => Ok(Self::Native(rest.to_string())),
            "script" => Ok(Self::Script(PathBuf::from(rest))),
            "rest" => Ok(Self::Rest(rest.to_string())),
            "db" => Ok(Self::Db(rest.to_string())),
            _ => Err(LoadError::UnknownLocator(locator.to_string())),
        }
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Native(_) => ToolKind::Native,
            Self::Script(_) => ToolKind::Script,
            Self::Rest(_) => ToolKind::Rest,
            Self::Db(_) => ToolKind::DbQuery,
        }
    }
}

/// Builds tool instances. Cheap to clone; shared by the reload manager's
/// validation tasks.
#[derive(Clone)]
pub struct ToolLoader {
    natives: NativeCatalog,
    security: SecurityConfig,
    http: reqwest::Client,
}

impl ToolLoader {
    pub fn new(natives: NativeCatalog, security: SecurityConfig) -> Self {
        Self {
            natives,
            security,
            http: reqwest::Client::new(),
        }
    }

    pub fn natives(&self) -> &NativeCatalog {
        &self.natives
    }

    /// Plugin code files backing a descriptor, beyond the descriptor itself.
    ///
    /// Their contents feed the reload fingerprint so a script edit is picked
    /// up like a descriptor edit.
    pub fn source_paths(&self, descriptor: &ToolDescriptor) -> Vec<PathBuf> {
        match ImplementationLocator::parse(&descriptor.implementation_locator) {
            Ok(ImplementationLocator::Script(relative)) => vec![resolve_relative(descriptor, relative)],
            _ => Vec::new(),
        }
    }

    /// Construct a fresh instance for the descriptor.
    ///
    /// Pure with respect to the registry: nothing is published here.
    pub fn instantiate(&self, descriptor: ToolDescriptor) -> Result<SharedTool, LoadError> {
        let locator = ImplementationLocator::parse(&descriptor.implementation_locator)?;
        debug!(
            "Instantiating '{}' v{} as {}",
            descriptor.name,
            descriptor.version,
            locator.kind()
        );

        let name = descriptor.name.clone();
        match locator {
            ImplementationLocator::Native(native) => {
                let spec = self.natives.get(&native).ok_or_else(|| {
                    LoadError::instantiate(
                        &name,
                        format!(
                            "unknown native tool '{}' (available: {})",
                            native,
                            self.natives.names().join(", ")
                        ),
                    )
                })?;
                let mut descriptor = descriptor;
                if descriptor.description.is_none() {
                    descriptor.description = Some(spec.description.to_string());
                }
                let schema = compile_schema(&descriptor, Some((spec.input_schema)()))?;
                Ok(Arc::new(NativeTool::new(Arc::new(descriptor), schema, spec.handler)))
            }
            ImplementationLocator::Script(relative) => {
                let path = resolve_relative(&descriptor, relative);
                let path = validate_path(&path, &self.security)
                    .map_err(|e| LoadError::instantiate(&name, e.to_string()))?;
                let interpreter = descriptor.config_str("interpreter").map(str::to_string);
                let schema = compile_schema(&descriptor, None)?;
                Ok(Arc::new(ScriptTool::new(Arc::new(descriptor), schema, path, interpreter)))
            }
            ImplementationLocator::Rest(template) => {
                let template =
                    RestTemplate::parse(&template).map_err(|e| LoadError::instantiate(&name, e))?;
                let schema = compile_schema(&descriptor, None)?;
                Ok(Arc::new(RestTool::new(
                    Arc::new(descriptor),
                    schema,
                    template,
                    self.http.clone(),
                )))
            }
            ImplementationLocator::Db(url) => {
                let schema = compile_schema(&descriptor, None)?;
                let tool = DbQueryTool::new(Arc::new(descriptor), schema, &url)
                    .map_err(|e| LoadError::instantiate(&name, e))?;
                Ok(Arc::new(tool))
            }
        }
    }
}

impl Default for ToolLoader {
    fn default() -> Self {
        Self::new(NativeCatalog::builtin(), SecurityConfig::default())
    }
}

fn resolve_relative(descriptor: &ToolDescriptor, relative: PathBuf) -> PathBuf {
    if relative.is_absolute() {
        return relative;
    }
    match descriptor.base_dir() {
        Some(dir) => dir.join(relative),
        None => relative,
    }
}

/// Descriptor schemas win; otherwise the strategy's own default.
fn compile_schema(
    descriptor: &ToolDescriptor,
    fallback_input: Option<Value>,
) -> Result<ToolSchema, LoadError> {
    let input = descriptor
        .input_schema
        .clone()
        .or(fallback_input)
        .unwrap_or_else(default_input_schema);
    let output = descriptor
        .output_schema
        .clone()
        .unwrap_or_else(default_output_schema);
    ToolSchema::compile(input, output).map_err(|e| LoadError::schema(&descriptor.name, e))
}

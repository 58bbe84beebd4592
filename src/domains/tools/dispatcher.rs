//! Protocol Dispatcher.
//!
//! Request lifecycle: `Received -> Decoded -> Authorized -> Validated ->
//! Executed -> Encoded`. Any failure short-circuits to an encoded error
//! envelope carrying the request id; every request gets exactly one
//! response.
//!
//! Methods:
//! - `tools.list` - enabled tools with their schemas (optional filter)
//! - `tools.describe` - one tool, with its metrics
//! - `tools.invoke` - validate then run a tool under a deadline
//! - `tools.metrics` - execution counters per tool
//! - `health.check` - liveness and registry summary

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::capability::{JsonObject, ToolKind};
use super::error::{DispatchError, ExecutionError};
use super::registry::{ListFilter, RegistryEntry, ToolRegistry};
use super::reload::{HotReloadManager, ReloadPhase};
use crate::core::security::{CallerIdentity, SharedAuthorizer};

// ============================================================================
// Envelope
// ============================================================================

/// A decoded request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    pub params: JsonObject,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: match params {
                Value::Object(map) => map,
                _ => JsonObject::new(),
            },
        }
    }

    /// Decode an envelope. On failure returns the id to answer with
    /// (null when it cannot be recovered) and the protocol error.
    pub fn decode(value: Value) -> Result<Self, (Value, DispatchError)> {
        let Value::Object(mut envelope) = value else {
            return Err((
                Value::Null,
                DispatchError::protocol("request must be a JSON object"),
            ));
        };

        let id = match envelope.remove("id") {
            None | Some(Value::Null) => Value::Null,
            Some(id @ (Value::String(_) | Value::Number(_))) => id,
            Some(_) => {
                return Err((
                    Value::Null,
                    DispatchError::protocol("id must be a string or a number"),
                ));
            }
        };

        let method = match envelope.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            Some(_) => return Err((id, DispatchError::protocol("method must be a non-empty string"))),
            None => return Err((id, DispatchError::protocol("missing method"))),
        };

        let params = match envelope.remove("params") {
            None | Some(Value::Null) => JsonObject::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return Err((id, DispatchError::protocol("params must be an object"))),
        };

        Ok(Self { id, method, params })
    }
}

/// Error member of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&DispatchError> for RpcErrorObject {
    fn from(error: &DispatchError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: error.data(),
        }
    }
}

/// A response envelope. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &DispatchError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Methods served by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    ListTools,
    DescribeTool,
    InvokeTool,
    Metrics,
    HealthCheck,
}

impl Method {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "tools.list" => Some(Self::ListTools),
            "tools.describe" => Some(Self::DescribeTool),
            "tools.invoke" => Some(Self::InvokeTool),
            "tools.metrics" => Some(Self::Metrics),
            "health.check" => Some(Self::HealthCheck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListTools => "tools.list",
            Self::DescribeTool => "tools.describe",
            Self::InvokeTool => "tools.invoke",
            Self::Metrics => "tools.metrics",
            Self::HealthCheck => "health.check",
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Deadlines and concurrency bounds.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_concurrent_requests: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            max_concurrent_requests: 64,
        }
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: Value,
    pub generation: u64,
    pub duration: Duration,
}

#[derive(Debug, Deserialize)]
struct InvokeParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_disabled: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    kind: Option<ToolKind>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsParams {
    #[serde(default)]
    name: Option<String>,
}

/// Routes decoded requests to the registry.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    authorizer: SharedAuthorizer,
    settings: DispatchSettings,
    permits: Semaphore,
    reload: Option<Arc<HotReloadManager>>,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        authorizer: SharedAuthorizer,
        settings: DispatchSettings,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent_requests.max(1));
        Self {
            registry,
            authorizer,
            settings,
            permits,
            reload: None,
            started_at: Instant::now(),
        }
    }

    /// Report reload state from `health.check`.
    pub fn with_reload(mut self, reload: Arc<HotReloadManager>) -> Self {
        self.reload = Some(reload);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Handle a raw request body.
    pub async fn handle_bytes(&self, body: &[u8], caller: &CallerIdentity) -> RpcResponse {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.handle_value(value, caller).await,
            Err(e) => {
                debug!("Unparseable request: {}", e);
                RpcResponse::failure(Value::Null, &DispatchError::Parse(e.to_string()))
            }
        }
    }

    /// Handle a parsed but not yet decoded envelope.
    pub async fn handle_value(&self, value: Value, caller: &CallerIdentity) -> RpcResponse {
        match RpcRequest::decode(value) {
            Ok(request) => self.handle(request, caller).await,
            Err((id, error)) => {
                debug!("Malformed envelope: {}", error);
                RpcResponse::failure(id, &error)
            }
        }
    }

    /// Handle a decoded request. Never panics; always answers with the request id.
    pub async fn handle(&self, request: RpcRequest, caller: &CallerIdentity) -> RpcResponse {
        let RpcRequest { id, method, params } = request;

        let outcome = match self.admit().await {
            Ok(_permit) => isolate(&method, self.route(&method, params, caller)).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => {
                if matches!(error, DispatchError::Internal(_)) {
                    error!(method = %method, "{}", error);
                } else {
                    debug!(method = %method, code = error.code(), "{}", error);
                }
                RpcResponse::failure(id, &error)
            }
        }
    }

    /// Wait for one of the `max_concurrent_requests` permits.
    async fn admit(&self) -> Result<SemaphorePermit<'_>, DispatchError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| DispatchError::internal("dispatcher is shutting down"))
    }

    async fn route(
        &self,
        method: &str,
        params: JsonObject,
        caller: &CallerIdentity,
    ) -> Result<Value, DispatchError> {
        let method =
            Method::parse(method).ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))?;

        match method {
            Method::ListTools => {
                let params: ListParams = parse_params(params)?;
                let filter = ListFilter {
                    include_disabled: params.include_disabled,
                    category: params.category,
                    tag: params.tag,
                    kind: params.kind,
                };
                let tools: Vec<Value> = self.list(&filter).iter().map(|e| summarize(e)).collect();
                Ok(json!({ "tools": tools }))
            }
            Method::DescribeTool => {
                let params: NameParams = parse_params(params)?;
                self.describe(&params.name, caller).await
            }
            Method::InvokeTool => {
                let params: InvokeParams = parse_params(params)?;
                let arguments = match params.arguments {
                    None | Some(Value::Null) => JsonObject::new(),
                    Some(Value::Object(arguments)) => arguments,
                    Some(_) => return Err(DispatchError::invalid_params("arguments must be an object")),
                };
                let timeout = params.timeout_ms.map(Duration::from_millis);
                let invocation = self
                    .invoke_admitted(&params.name, arguments, timeout, caller)
                    .await?;
                Ok(json!({
                    "tool": params.name,
                    "generation": invocation.generation,
                    "duration_ms": invocation.duration.as_secs_f64() * 1000.0,
                    "output": invocation.output,
                }))
            }
            Method::Metrics => {
                let params: MetricsParams = parse_params(params)?;
                self.metrics(params.name.as_deref())
            }
            Method::HealthCheck => Ok(self.health()),
        }
    }

    /// Enabled tools matching the filter.
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<RegistryEntry>> {
        self.registry.list(filter)
    }

    /// Resolve a tool the caller may use.
    pub async fn resolve(
        &self,
        name: &str,
        caller: &CallerIdentity,
    ) -> Result<Arc<RegistryEntry>, DispatchError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::tool_not_found(name))?;
        if !self.authorizer.is_authorized(caller, name).await {
            warn!(tool = name, caller = %caller, "Authorization denied");
            return Err(DispatchError::Unauthorized {
                identity: caller.to_string(),
                tool: name.to_string(),
            });
        }
        Ok(entry)
    }

    /// Full description of one tool, including its metrics.
    pub async fn describe(&self, name: &str, caller: &CallerIdentity) -> Result<Value, DispatchError> {
        let entry = self.resolve(name, caller).await?;
        let mut description = summarize(&entry);
        if let Value::Object(map) = &mut description {
            map.insert("metrics".to_string(), json!(entry.metrics().snapshot()));
            map.insert("source".to_string(), json!(entry.descriptor().source));
        }
        Ok(description)
    }

    /// Validate and execute a tool under a deadline.
    ///
    /// Entry point for callers outside the JSON-RPC envelope (MCP
    /// sessions). Takes a concurrency permit and turns panics into
    /// `Internal` errors, exactly as [`handle`](Self::handle) does.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: JsonObject,
        timeout: Option<Duration>,
        caller: &CallerIdentity,
    ) -> Result<Invocation, DispatchError> {
        let _permit = self.admit().await?;
        isolate(
            Method::InvokeTool.as_str(),
            self.invoke_admitted(name, arguments, timeout, caller),
        )
        .await
    }

    /// Invocation body; the caller already holds a permit.
    ///
    /// Validation and authorization failures never reach the tool and are
    /// not counted. Every execution is recorded, whatever its outcome. A
    /// timed-out call is abandoned, not killed: its task is aborted at its
    /// next await point and its result, if any, is discarded.
    #[instrument(skip(self, arguments, timeout, caller), fields(caller = %caller))]
    async fn invoke_admitted(
        &self,
        name: &str,
        arguments: JsonObject,
        timeout: Option<Duration>,
        caller: &CallerIdentity,
    ) -> Result<Invocation, DispatchError> {
        let entry = self.resolve(name, caller).await?;

        let report = entry.instance().validate(&arguments);
        if !report.is_valid() {
            return Err(DispatchError::Validation {
                tool: name.to_string(),
                violations: report.violations,
            });
        }

        let deadline = self.deadline(&entry, timeout);
        let guard = entry.begin_call();
        let instance = entry.instance().clone();
        let started = Instant::now();
        let mut task = tokio::spawn(async move {
            let _guard = guard;
            instance.execute(arguments).await
        });

        let outcome = tokio::time::timeout(deadline, &mut task).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Err(_) => {
                task.abort();
                Err(DispatchError::Timeout {
                    tool: name.to_string(),
                    timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Ok(Err(join_error)) => Err(DispatchError::internal(format!(
                "tool '{}' crashed: {}",
                name, join_error
            ))),
            Ok(Ok(Err(source))) => Err(DispatchError::Execution {
                tool: name.to_string(),
                source,
            }),
            Ok(Ok(Ok(output))) => match entry.instance().schema().check_output(&output) {
                Ok(()) => Ok(output),
                Err(message) => Err(DispatchError::Execution {
                    tool: name.to_string(),
                    source: ExecutionError::invalid_output(message),
                }),
            },
        };

        if !self.registry.record_execution(name, elapsed, result.is_ok()) {
            debug!("Tool '{}' was unregistered mid-call; execution not recorded", name);
        }
        match &result {
            Ok(_) => info!(generation = entry.generation(), "Tool '{}' completed in {:?}", name, elapsed),
            Err(e) => warn!(generation = entry.generation(), "Tool '{}' failed after {:?}: {}", name, elapsed, e),
        }

        result.map(|output| Invocation {
            output,
            generation: entry.generation(),
            duration: elapsed,
        })
    }

    /// Caller deadline, else the tool's hint, else the default; capped.
    fn deadline(&self, entry: &RegistryEntry, requested: Option<Duration>) -> Duration {
        requested
            .or_else(|| entry.descriptor().timeout_ms().map(Duration::from_millis))
            .unwrap_or(self.settings.default_timeout)
            .min(self.settings.max_timeout)
            .max(Duration::from_millis(1))
    }

    /// Execution counters for one tool or all of them.
    pub fn metrics(&self, name: Option<&str>) -> Result<Value, DispatchError> {
        match name {
            Some(name) => {
                let entry = self
                    .registry
                    .get(name)
                    .ok_or_else(|| DispatchError::tool_not_found(name))?;
                Ok(json!({ "tool": name, "metrics": entry.metrics().snapshot() }))
            }
            None => {
                let tools: serde_json::Map<String, Value> = self
                    .registry
                    .list(&ListFilter::default())
                    .iter()
                    .map(|e| (e.name().to_string(), json!(e.metrics().snapshot())))
                    .collect();
                Ok(json!({ "tools": tools }))
            }
        }
    }

    pub fn health(&self) -> Value {
        let all = ListFilter {
            include_disabled: true,
            ..Default::default()
        };
        let registered = self.registry.list(&all);
        let enabled = registered.iter().filter(|e| e.is_enabled()).count();
        let mut health = json!({
            "status": "ok",
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "tools": { "registered": registered.len(), "enabled": enabled },
            "available_permits": self.permits.available_permits(),
        });
        if let (Some(reload), Value::Object(map)) = (&self.reload, &mut health) {
            let sources = reload.sources();
            let rejected = sources
                .iter()
                .filter(|s| s.phase == ReloadPhase::Rejected)
                .count();
            map.insert(
                "reload".to_string(),
                json!({
                    "sources": sources.len(),
                    "rejected": rejected,
                    "draining": reload.draining(),
                    "watching": reload.is_watching(),
                }),
            );
        }
        health
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: JsonObject) -> Result<T, DispatchError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| DispatchError::invalid_params(e.to_string()))
}

/// Catalog view of an entry.
fn summarize(entry: &RegistryEntry) -> Value {
    let descriptor = entry.descriptor();
    json!({
        "name": descriptor.name,
        "version": descriptor.version,
        "description": descriptor.description,
        "kind": entry.kind(),
        "enabled": descriptor.enabled,
        "generation": entry.generation(),
        "metadata": descriptor.metadata,
        "input_schema": entry.instance().input_schema(),
        "output_schema": entry.instance().output_schema(),
    })
}

/// Run `work`, converting a panic into an `Internal` error.
async fn isolate<T>(
    method: &str,
    work: impl std::future::Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(method = %method, "Request handling panicked: {}", message);
        Err(DispatchError::internal(format!("request handling panicked: {}", message)))
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

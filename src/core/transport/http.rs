//! HTTP transport implementation.
//!
//! Serves the runtime's JSON-RPC methods (`tools.list`, `tools.describe`,
//! `tools.invoke`, `tools.metrics`, `health.check`) over POST requests.
//! The caller identity is taken from the `x-caller-identity` header and
//! falls back to the configured default identity.

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use ::http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, instrument};

use super::{TransportError, TransportResult, config::HttpConfig};
use crate::core::McpServer;
use crate::core::security::CallerIdentity;

/// Header carrying the caller identity.
pub const CALLER_IDENTITY_HEADER: &str = "x-caller-identity";

/// HTTP transport handler.
pub struct HttpTransport {
    config: HttpConfig,
}

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    server: McpServer,
    rpc_path: String,
}

impl HttpTransport {
    /// Create a new HTTP transport with the given config.
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    /// Get the bind address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Build the axum router without binding a socket.
    pub fn router(&self, server: McpServer) -> Router {
        let state = AppState {
            server,
            rpc_path: self.config.rpc_path.clone(),
        };

        let mut app = Router::new()
            .route(&self.config.rpc_path, post(handle_rpc))
            .route("/health", get(health_check))
            .route("/", get(root_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .with_state(state);

        // Add CORS if enabled
        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }
        app
    }

    /// Serve until `shutdown` fires; in-flight requests are allowed to finish.
    pub async fn run(self, server: McpServer, shutdown: CancellationToken) -> TransportResult<()> {
        let addr = self.address();
        let app = self.router(server);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::bind(&addr, e))?;

        let cors_status = if self.config.enable_cors {
            "enabled"
        } else {
            "disabled"
        };
        info!(
            "Ready - listening on {} (JSON-RPC over HTTP, CORS {})",
            addr, cors_status
        );
        info!("  → JSON-RPC: POST {}", self.config.rpc_path);
        info!("  → Health:   GET /health");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| TransportError::http(e.to_string()))?;

        Ok(())
    }
}

/// Root handler - provides API info.
async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": state.server.name(),
        "version": state.server.version(),
        "transport": "HTTP",
        "endpoints": {
            "rpc": state.rpc_path,
            "health": "/health"
        },
        "protocol": "JSON-RPC 2.0",
        "methods": ["tools.list", "tools.describe", "tools.invoke", "tools.metrics", "health.check"],
        "documentation": format!(
            "POST JSON-RPC requests to {}; set the {} header to identify the caller",
            state.rpc_path, CALLER_IDENTITY_HEADER
        )
    }))
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut health = state.server.dispatcher().health();
    if let serde_json::Value::Object(map) = &mut health {
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    Json(health)
}

fn caller_identity(headers: &HeaderMap, state: &AppState) -> CallerIdentity {
    headers
        .get(CALLER_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(CallerIdentity::from)
        .unwrap_or_else(|| state.server.runtime().default_identity().clone())
}

/// Handle JSON-RPC requests.
///
/// The body is taken raw so malformed JSON still gets a JSON-RPC parse
/// error instead of an HTTP rejection.
#[instrument(skip_all, fields(caller))]
async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let caller = caller_identity(&headers, &state);
    tracing::Span::current().record("caller", caller.as_str());
    debug!("Received JSON-RPC request ({} bytes)", body.len());

    let response = state.server.dispatcher().handle_bytes(&body, &caller).await;

    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::domains::tools::ToolRuntime;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(dir: &TempDir) -> Router {
        fs::write(
            dir.path().join("echo.json"),
            json!({
                "name": "echo",
                "implementation_locator": "native:echo",
                "version": "1.0.0"
            })
            .to_string(),
        )
        .unwrap();
        let mut config = Config::default();
        config.runtime.descriptors_dir = dir.path().to_path_buf();
        let runtime = ToolRuntime::from_config(&config).unwrap();
        runtime.load().await.unwrap();
        let server = McpServer::with_runtime(config, runtime);
        HttpTransport::new(HttpConfig::default()).router(server)
    }

    async fn post_rpc(app: Router, body: &str, caller: Option<&str>) -> Value {
        let mut request = ::http::Request::post("/rpc").header("content-type", "application/json");
        if let Some(caller) = caller {
            request = request.header(CALLER_IDENTITY_HEADER, caller);
        }
        let response = app
            .oneshot(request.body(axum::body::Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_over_http() {
        let dir = TempDir::new().unwrap();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools.invoke",
            "params": { "name": "echo", "arguments": { "text": "hello" } }
        })
        .to_string();

        let response = post_rpc(app(&dir).await, &body, Some("alice")).await;
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["result"]["tool"], json!("echo"));
        assert!(response.get("error").is_none() || response["error"].is_null());
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let response = post_rpc(app(&dir).await, "{not json", None).await;
        assert_eq!(response["error"]["code"], json!(-32700));
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = HttpConfig {
            max_body_bytes: 64,
            ..HttpConfig::default()
        };
        let mut runtime_config = Config::default();
        runtime_config.runtime.descriptors_dir = dir.path().to_path_buf();
        let runtime = ToolRuntime::from_config(&runtime_config).unwrap();
        let app = HttpTransport::new(config).router(McpServer::with_runtime(runtime_config, runtime));

        let response = app
            .oneshot(
                ::http::Request::post("/rpc")
                    .body(axum::body::Body::from("x".repeat(1024)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_health_route() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .await
            .oneshot(
                ::http::Request::get("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let health: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health["status"], json!("ok"));
        assert_eq!(health["tools"]["registered"], json!(1));
    }
}

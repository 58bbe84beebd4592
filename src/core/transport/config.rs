//! Transport selection and listener settings.
//!
//! `MCP_TRANSPORT` picks the transport (`stdio`, `tcp`, `http`); an unknown
//! or disabled value falls back to the first compiled-in transport.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::config::env_parse;

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// One MCP session over stdin/stdout.
    #[cfg(feature = "stdio")]
    Stdio,

    /// One MCP session per accepted TCP connection.
    #[cfg(feature = "tcp")]
    Tcp(TcpConfig),

    /// Runtime JSON-RPC methods over HTTP POST.
    #[cfg(feature = "http")]
    Http(HttpConfig),
}

#[cfg(feature = "tcp")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[cfg(feature = "http")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,

    /// Route accepting JSON-RPC envelopes.
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Largest accepted request body; larger bodies get 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[cfg(any(feature = "tcp", feature = "http"))]
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

#[cfg(feature = "http")]
fn default_rpc_path() -> String {
    "/rpc".to_string()
}

#[cfg(feature = "http")]
fn default_true() -> bool {
    true
}

#[cfg(feature = "http")]
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[cfg(feature = "tcp")]
impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 3000,
        }
    }
}

#[cfg(feature = "tcp")]
impl TcpConfig {
    fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(host) = std::env::var("MCP_TCP_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env_parse("MCP_TCP_PORT") {
            cfg.port = port;
        }
        cfg
    }
}

#[cfg(feature = "http")]
impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 8080,
            rpc_path: default_rpc_path(),
            enable_cors: default_true(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[cfg(feature = "http")]
impl HttpConfig {
    fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(host) = std::env::var("MCP_HTTP_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env_parse("MCP_HTTP_PORT") {
            cfg.port = port;
        }
        if let Ok(path) = std::env::var("MCP_HTTP_PATH") {
            cfg.rpc_path = if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            };
        }
        if let Some(cors) = env_parse("MCP_HTTP_CORS") {
            cfg.enable_cors = cors;
        }
        if let Some(limit) = env_parse("MCP_HTTP_MAX_BODY_BYTES") {
            cfg.max_body_bytes = limit;
        }
        cfg
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        #[cfg(feature = "stdio")]
        {
            return Self::Stdio;
        }

        #[cfg(all(not(feature = "stdio"), feature = "tcp"))]
        {
            return Self::Tcp(TcpConfig::default());
        }

        #[cfg(all(not(feature = "stdio"), not(feature = "tcp"), feature = "http"))]
        {
            return Self::Http(HttpConfig::default());
        }

        #[cfg(not(any(feature = "stdio", feature = "tcp", feature = "http")))]
        {
            compile_error!("At least one transport feature must be enabled: stdio, tcp, or http");
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        let requested = std::env::var("MCP_TRANSPORT")
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        match requested.as_str() {
            #[cfg(feature = "stdio")]
            "stdio" => Self::Stdio,
            #[cfg(feature = "tcp")]
            "tcp" => Self::Tcp(TcpConfig::from_env()),
            #[cfg(feature = "http")]
            "http" => Self::Http(HttpConfig::from_env()),
            "" => Self::default(),
            other => {
                let fallback = Self::default();
                warn!(
                    "Transport '{}' is unknown or not compiled in; using {}",
                    other,
                    fallback.description()
                );
                fallback
            }
        }
    }

    /// Human-readable summary for startup logs.
    pub fn description(&self) -> String {
        match self {
            #[cfg(feature = "stdio")]
            Self::Stdio => "STDIO (MCP session)".to_string(),
            #[cfg(feature = "tcp")]
            Self::Tcp(cfg) => format!("TCP on {}:{} (MCP sessions)", cfg.host, cfg.port),
            #[cfg(feature = "http")]
            Self::Http(cfg) => format!(
                "HTTP on {}:{}{} (runtime JSON-RPC)",
                cfg.host, cfg.port, cfg.rpc_path
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::tests::ENV_TEST_LOCK;

    #[cfg(feature = "stdio")]
    #[test]
    fn test_unset_or_unknown_transport_uses_default() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("MCP_TRANSPORT");
        }
        assert!(matches!(TransportConfig::from_env(), TransportConfig::Stdio));

        unsafe {
            std::env::set_var("MCP_TRANSPORT", "carrier-pigeon");
        }
        assert!(matches!(TransportConfig::from_env(), TransportConfig::Stdio));
        unsafe {
            std::env::remove_var("MCP_TRANSPORT");
        }
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_from_env() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("MCP_TRANSPORT", "HTTP");
            std::env::set_var("MCP_HTTP_PORT", "9191");
            std::env::set_var("MCP_HTTP_PATH", "jsonrpc");
            std::env::set_var("MCP_HTTP_CORS", "false");
        }
        match TransportConfig::from_env() {
            TransportConfig::Http(cfg) => {
                assert_eq!(cfg.port, 9191);
                assert_eq!(cfg.rpc_path, "/jsonrpc");
                assert!(!cfg.enable_cors);
                assert_eq!(cfg.max_body_bytes, 1024 * 1024);
            }
            other => panic!("expected http transport, got {:?}", other),
        }
        unsafe {
            std::env::remove_var("MCP_TRANSPORT");
            std::env::remove_var("MCP_HTTP_PORT");
            std::env::remove_var("MCP_HTTP_PATH");
            std::env::remove_var("MCP_HTTP_CORS");
        }
    }

    #[cfg(feature = "tcp")]
    #[test]
    fn test_tcp_bad_port_keeps_default() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("MCP_TRANSPORT", "tcp");
            std::env::set_var("MCP_TCP_PORT", "not-a-port");
        }
        match TransportConfig::from_env() {
            TransportConfig::Tcp(cfg) => assert_eq!(cfg.port, 3000),
            other => panic!("expected tcp transport, got {:?}", other),
        }
        unsafe {
            std::env::remove_var("MCP_TRANSPORT");
            std::env::remove_var("MCP_TCP_PORT");
        }
    }
}

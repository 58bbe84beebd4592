//! Configuration management for the tool runtime server.
//!
//! This module provides a centralized configuration structure that can be
//! populated from environment variables (optionally via a `.env` file) or
//! defaults.

use super::error::{Error, Result};
use super::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::domains::tools::{DispatchSettings, ReloadSettings};

/// Main configuration structure for the server.
///
/// This struct contains all configurable aspects of the server, organized
/// by concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identification and metadata.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Transport configuration.
    pub transport: TransportConfig,

    /// Descriptor store, hot reload and dispatch limits.
    pub runtime: RuntimeConfig,

    /// Caller identity and authorization policy.
    pub auth: AuthConfig,

    /// Security and path validation configuration.
    pub security: SecurityConfig,
}

/// Server identification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The name of the server as reported to clients.
    pub name: String,

    /// The version of the server.
    pub version: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    pub level: String,

    /// Whether to include timestamps in log output.
    pub with_timestamps: bool,
}

/// Tool runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root of the descriptor store.
    pub descriptors_dir: PathBuf,

    /// Seconds between reload ticks.
    pub reload_interval_secs: u64,

    /// Also wake the reload loop on filesystem events.
    pub reload_watch: bool,

    /// Upper bound on waiting for a replaced instance's in-flight calls.
    pub drain_timeout_secs: u64,

    /// Deadline for an invocation when neither caller nor tool sets one.
    pub default_timeout_ms: u64,

    /// Cap applied to every deadline.
    pub max_timeout_ms: u64,

    /// Requests handled at once; further requests wait for a permit.
    pub max_concurrent_requests: usize,
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identity used for sessions that carry none (stdio, tcp).
    pub default_identity: String,

    /// JSON policy file mapping identities to tool patterns.
    /// If None, every caller may use every tool.
    pub policy_file: Option<PathBuf>,
}

/// Configuration for security and path validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Optional root directory for script plugins.
    /// If None, no path restrictions are enforced.
    pub root_path: Option<PathBuf>,

    /// Whether to allow symlinked plugin files.
    /// If true, symlinks are followed and their targets are validated.
    /// If false, any symlink is rejected.
    pub allow_symlinks: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            descriptors_dir: PathBuf::from("./tools"),
            reload_interval_secs: 5,
            reload_watch: true,
            drain_timeout_secs: 5,
            default_timeout_ms: 30_000,
            max_timeout_ms: 120_000,
            max_concurrent_requests: 64,
        }
    }
}

impl Config {
    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let runtime = &self.runtime;
        if runtime.max_concurrent_requests == 0 {
            return Err(Error::config("MCP_MAX_CONCURRENT_REQUESTS must be at least 1"));
        }
        if runtime.default_timeout_ms == 0 {
            return Err(Error::config("MCP_DEFAULT_TIMEOUT_MS must be at least 1"));
        }
        if runtime.max_timeout_ms < runtime.default_timeout_ms {
            return Err(Error::config(format!(
                "MCP_MAX_TIMEOUT_MS ({}) is below MCP_DEFAULT_TIMEOUT_MS ({})",
                runtime.max_timeout_ms, runtime.default_timeout_ms
            )));
        }
        if self.auth.default_identity.trim().is_empty() {
            return Err(Error::config("MCP_DEFAULT_IDENTITY must not be empty"));
        }
        Ok(())
    }
}

impl RuntimeConfig {
    pub fn reload_settings(&self) -> ReloadSettings {
        ReloadSettings {
            interval: Duration::from_secs(self.reload_interval_secs.max(1)),
            watch: self.reload_watch,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            max_concurrent_requests: self.max_concurrent_requests,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_identity: "local".to_string(),
            policy_file: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            // No root path restriction by default
            root_path: None,
            // Allow symlinks by default with validation
            allow_symlinks: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                name: "tool-runtime-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                with_timestamps: true,
            },
            transport: TransportConfig::default(),
            runtime: RuntimeConfig::default(),
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Parse an environment variable, keeping the default on bad input.
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: '{}'", key, raw);
            None
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables are expected to be prefixed with `MCP_`.
    /// For example: `MCP_SERVER_NAME`, `MCP_DESCRIPTORS_DIR`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(name) = std::env::var("MCP_SERVER_NAME") {
            config.server.name = name;
        }

        if let Ok(level) = std::env::var("MCP_LOG_LEVEL") {
            config.logging.level = level;
        }

        // Load transport configuration from environment
        config.transport = TransportConfig::from_env();

        // Runtime
        let runtime = &mut config.runtime;
        if let Ok(dir) = std::env::var("MCP_DESCRIPTORS_DIR") {
            runtime.descriptors_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse("MCP_RELOAD_INTERVAL_SECS") {
            runtime.reload_interval_secs = secs;
        }
        if let Some(watch) = env_parse("MCP_RELOAD_WATCH") {
            runtime.reload_watch = watch;
        }
        if let Some(secs) = env_parse("MCP_DRAIN_TIMEOUT_SECS") {
            runtime.drain_timeout_secs = secs;
        }
        if let Some(ms) = env_parse("MCP_DEFAULT_TIMEOUT_MS") {
            runtime.default_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("MCP_MAX_TIMEOUT_MS") {
            runtime.max_timeout_ms = ms;
        }
        if let Some(n) = env_parse("MCP_MAX_CONCURRENT_REQUESTS") {
            runtime.max_concurrent_requests = n;
        }

        // Authorization
        if let Ok(identity) = std::env::var("MCP_DEFAULT_IDENTITY") {
            config.auth.default_identity = identity;
        }
        if let Ok(policy) = std::env::var("MCP_AUTH_POLICY_FILE") {
            config.auth.policy_file = Some(PathBuf::from(policy));
            info!("Authorization policy: {:?}", config.auth.policy_file);
        } else {
            warn!("MCP_AUTH_POLICY_FILE not set - every caller may use every tool.");
        }

        // Load security configuration
        if let Ok(root_path) = std::env::var("MCP_ROOT_PATH") {
            config.security.root_path = Some(PathBuf::from(root_path));
            info!(
                "Path security enabled: script plugins confined to {:?}",
                config.security.root_path
            );
        } else {
            warn!(
                "MCP_ROOT_PATH not set - no path restrictions active. \
                 Script plugins may live anywhere."
            );
        }

        if let Ok(allow_symlinks) = std::env::var("MCP_ALLOW_SYMLINKS") {
            config.security.allow_symlinks = allow_symlinks.parse().unwrap_or(true);
            info!("Symlinks allowed: {}", config.security.allow_symlinks);
        }

        config
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Every test touching MCP_* variables takes this lock.
    pub(crate) static ENV_TEST_LOCK: Mutex<()> = Mutex::new(());

    const RUNTIME_VARS: &[&str] = &[
        "MCP_DESCRIPTORS_DIR",
        "MCP_RELOAD_INTERVAL_SECS",
        "MCP_RELOAD_WATCH",
        "MCP_DRAIN_TIMEOUT_SECS",
        "MCP_DEFAULT_TIMEOUT_MS",
        "MCP_MAX_TIMEOUT_MS",
        "MCP_MAX_CONCURRENT_REQUESTS",
        "MCP_DEFAULT_IDENTITY",
        "MCP_AUTH_POLICY_FILE",
    ];

    fn clear_runtime_vars() {
        for key in RUNTIME_VARS {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_runtime_from_env() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        clear_runtime_vars();
        unsafe {
            std::env::set_var("MCP_DESCRIPTORS_DIR", "/srv/tools");
            std::env::set_var("MCP_RELOAD_INTERVAL_SECS", "2");
            std::env::set_var("MCP_RELOAD_WATCH", "false");
            std::env::set_var("MCP_DEFAULT_TIMEOUT_MS", "1500");
            std::env::set_var("MCP_MAX_TIMEOUT_MS", "9000");
            std::env::set_var("MCP_MAX_CONCURRENT_REQUESTS", "8");
            std::env::set_var("MCP_DEFAULT_IDENTITY", "ci");
            std::env::set_var("MCP_AUTH_POLICY_FILE", "/etc/tools/policy.json");
        }

        let config = Config::from_env();
        assert_eq!(config.runtime.descriptors_dir, PathBuf::from("/srv/tools"));
        assert_eq!(config.runtime.reload_interval_secs, 2);
        assert!(!config.runtime.reload_watch);
        assert_eq!(config.runtime.default_timeout_ms, 1500);
        assert_eq!(config.runtime.max_timeout_ms, 9000);
        assert_eq!(config.runtime.max_concurrent_requests, 8);
        assert_eq!(config.auth.default_identity, "ci");
        assert_eq!(
            config.auth.policy_file,
            Some(PathBuf::from("/etc/tools/policy.json"))
        );

        clear_runtime_vars();
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let _lock = ENV_TEST_LOCK.lock().unwrap();
        clear_runtime_vars();
        unsafe {
            std::env::set_var("MCP_RELOAD_INTERVAL_SECS", "soon");
            std::env::set_var("MCP_DRAIN_TIMEOUT_SECS", "-3");
        }

        let config = Config::from_env();
        assert_eq!(config.runtime.reload_interval_secs, 5);
        assert_eq!(config.runtime.drain_timeout_secs, 5);
        assert_eq!(config.runtime.max_timeout_ms, 120_000);

        clear_runtime_vars();
    }

    #[test]
    fn test_settings_conversion() {
        let runtime = RuntimeConfig {
            reload_interval_secs: 0,
            ..RuntimeConfig::default()
        };
        let reload = runtime.reload_settings();
        assert_eq!(reload.interval, Duration::from_secs(1));
        assert_eq!(reload.drain_timeout, Duration::from_secs(5));

        let dispatch = runtime.dispatch_settings();
        assert_eq!(dispatch.default_timeout, Duration::from_secs(30));
        assert_eq!(dispatch.max_timeout, Duration::from_secs(120));
        assert_eq!(dispatch.max_concurrent_requests, 64);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.runtime.max_concurrent_requests = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.runtime.max_timeout_ms = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MCP_MAX_TIMEOUT_MS"));

        let mut config = Config::default();
        config.auth.default_identity = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.name, "tool-runtime-server");
        assert_eq!(config.auth.default_identity, "local");
        assert!(config.auth.policy_file.is_none());
        assert!(config.security.root_path.is_none());
    }
}

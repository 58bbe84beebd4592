//! Caller authorization.
//!
//! The dispatcher only ever asks one question: may this identity use this
//! tool? Who answers it is pluggable through [`Authorizer`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque identity of the party issuing a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Capability check consulted before a tool is described or invoked.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(&self, identity: &CallerIdentity, tool_name: &str) -> bool;
}

pub type SharedAuthorizer = Arc<dyn Authorizer>;

/// Grants everything. Used when no policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_authorized(&self, _identity: &CallerIdentity, _tool_name: &str) -> bool {
        true
    }
}

/// Errors raised while loading a policy file.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read auth policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid auth policy {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Static allow-list keyed by identity.
///
/// File format:
///
/// ```json
/// { "dashboard": ["*"], "analyst": ["echo", "fred_*"] }
/// ```
///
/// A pattern is either `*`, an exact tool name, or a prefix ending in `*`.
/// The `*` identity applies to every caller. Anything not granted is denied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PolicyAuthorizer {
    grants: HashMap<String, Vec<String>>,
}

impl PolicyAuthorizer {
    pub fn new(grants: HashMap<String, Vec<String>>) -> Self {
        Self { grants }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let policy = Self::from_json(&content).map_err(|source| PolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Loaded auth policy from {} ({} identities)",
            path.display(),
            policy.grants.len()
        );
        Ok(policy)
    }

    fn grants_for<'a>(&'a self, identity: &str) -> impl Iterator<Item = &'a String> {
        self.grants
            .get(identity)
            .into_iter()
            .chain(self.grants.get("*"))
            .flatten()
    }
}

fn pattern_matches(pattern: &str, tool_name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => tool_name.starts_with(prefix),
        None => pattern == tool_name,
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn is_authorized(&self, identity: &CallerIdentity, tool_name: &str) -> bool {
        let granted = self
            .grants_for(identity.as_str())
            .any(|pattern| pattern_matches(pattern, tool_name));
        if !granted {
            debug!("Policy denies '{}' access to '{}'", identity, tool_name);
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const POLICY: &str = r#"{
        "dashboard": ["*"],
        "analyst": ["echo", "fred_*"],
        "*": ["health_probe"]
    }"#;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.is_authorized(&"anyone".into(), "echo").await);
    }

    #[tokio::test]
    async fn test_policy_patterns() {
        let policy = PolicyAuthorizer::from_json(POLICY).unwrap();
        let analyst = CallerIdentity::new("analyst");

        assert!(policy.is_authorized(&analyst, "echo").await);
        assert!(policy.is_authorized(&analyst, "fred_series").await);
        assert!(!policy.is_authorized(&analyst, "sec_filings").await);
        assert!(!policy.is_authorized(&analyst, "echo2").await);
        assert!(policy.is_authorized(&"dashboard".into(), "sec_filings").await);
    }

    #[tokio::test]
    async fn test_wildcard_identity_and_default_deny() {
        let policy = PolicyAuthorizer::from_json(POLICY).unwrap();
        let stranger = CallerIdentity::new("stranger");

        assert!(policy.is_authorized(&stranger, "health_probe").await);
        assert!(!policy.is_authorized(&stranger, "echo").await);
    }

    #[test]
    fn test_from_file_errors() {
        let missing = PolicyAuthorizer::from_file(Path::new("/nonexistent/policy.json"));
        assert!(matches!(missing, Err(PolicyError::Io { .. })));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[1, 2]").unwrap();
        let bad = PolicyAuthorizer::from_file(file.path());
        assert!(matches!(bad, Err(PolicyError::Parse { .. })));
    }
}

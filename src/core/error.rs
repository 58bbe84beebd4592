//! Error types and handling for the tool runtime server.
//!
//! Startup and serving failures from the tools domain and the
//! infrastructure around it, unified so `main` can propagate them with `?`.

use thiserror::Error;

use super::security::PolicyError;
use super::transport::TransportError;
use crate::domains::tools::{DispatchError, LoadError};

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the server.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor or plugin could not be loaded.
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// A request could not be served.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// The authorization policy could not be loaded.
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// A transport failed to start or serve.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Settings that parse but cannot be honored.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_load_error_converts() {
        let err: Error = LoadError::UnknownLocator("python:x".into()).into();
        assert!(matches!(err, Error::Load(_)));
        assert!(err.to_string().contains("python:x"));
    }

    #[test]
    fn test_policy_error_converts() {
        let err: Error = PolicyError::Io {
            path: PathBuf::from("/etc/policy.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into();
        assert!(matches!(err, Error::Policy(_)));
    }
}

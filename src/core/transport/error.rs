//! Transport error types.

use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Failures owned by the transport layer. Tool and protocol failures never
/// surface here; they are answered inside the session or the HTTP body.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The MCP handshake did not complete.
    #[error("Session initialization failed: {0}")]
    SessionInit(String),

    /// An established MCP session terminated with an error.
    #[error("Session ended abnormally: {0}")]
    Session(String),

    #[error("HTTP server error: {0}")]
    Http(String),
}

impl TransportError {
    pub fn bind(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            source,
        }
    }

    pub fn session_init(msg: impl Into<String>) -> Self {
        Self::SessionInit(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }
}

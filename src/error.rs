//! Crate-level error type
//!
//! Almost every failure inside the bridge becomes descriptive text in a
//! [`ToolOutput`](crate::bridge::ToolOutput) so a calling agent can reason about
//! it. [`BridgeError`] is reserved for what callers must treat as control flow:
//! an unreachable configuration store, invalid configuration handed to the
//! configuration API, or an operation on a server the owner never configured.
//!
//! ```rust
//! use toolbridge::error::BridgeError;
//!
//! let error = BridgeError::unknown_server("alice", "files");
//! assert_eq!(error.to_string(), "No such server 'files' configured for owner 'alice'");
//! ```

use crate::config::ConfigError;
use crate::mcp::error::MCPOperationError;
use thiserror::Error;

/// Errors surfaced by the public bridge API
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid configuration supplied to the bridge
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// The caller-owned configuration store could not be read or written
    #[error("Configuration store unavailable: {message}")]
    ConfigStoreUnavailable { message: String },

    /// The owner has no server by this name
    #[error("No such server '{server}' configured for owner '{owner_id}'")]
    UnknownServer { owner_id: String, server: String },

    /// Protocol or transport failure outside the invocation path
    #[error(transparent)]
    Mcp(#[from] MCPOperationError),
}

impl BridgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn unknown_server(owner_id: impl Into<String>, server: impl Into<String>) -> Self {
        Self::UnknownServer {
            owner_id: owner_id.into(),
            server: server.into(),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::StoreUnavailable(message) => Self::ConfigStoreUnavailable { message },
            other => Self::ConfigurationError {
                message: other.to_string(),
            },
        }
    }
}

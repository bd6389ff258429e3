//! Error handling for tool-server operations
//!
//! This module provides the error type shared by the wire codec, the transports,
//! the request correlator and the session layer. Errors are grouped by where the
//! failure happened so the dispatcher can decide whether a Session survives it.
//!
//! # Error Categories
//!
//! - **Transport Errors** - process spawn, pipe, and HTTP failures
//! - **Protocol Errors** - malformed or unexpected replies, handshake failures
//! - **Server Errors** - JSON-RPC error replies reported by the tool server
//! - **Lifecycle Errors** - timeouts, lost connections, process exits
//!
//! # Error Classification
//!
//! ```rust
//! # use toolbridge::mcp::error::MCPOperationError;
//! # use std::time::Duration;
//! let error = MCPOperationError::timeout(Duration::from_secs(30));
//! assert!(error.is_timeout());
//! // A slow call does not kill the session
//! assert!(!error.is_session_fatal());
//!
//! let crash = MCPOperationError::process_exited(Some(1));
//! assert!(crash.is_session_fatal());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Primary error type for all tool-server operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MCPOperationError {
    /// Transport-level connection errors
    #[error("Transport error: {message}")]
    TransportError { message: String },

    /// Stdio transport errors (process spawn and pipe communication)
    #[error("Stdio transport error: {message}")]
    StdioError { message: String },

    /// Network transport errors
    #[error("HTTP transport error: {message}")]
    HttpError { message: String },

    /// JSON-RPC protocol errors
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// Handshake failures
    #[error("Initialization error: {message}")]
    InitializationError { message: String },

    /// A request did not receive a reply in time
    #[error("Timeout error: operation timed out after {duration:?}")]
    TimeoutError { duration: Duration },

    /// Error reply sent by the tool server
    #[error("Server error [{code}]: {message}")]
    ServerError { code: i32, message: String },

    /// The requested tool was not discovered on the server
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    /// Session state errors (not ready, already closed)
    #[error("Session error: {message}")]
    SessionError { message: String },

    /// Connection lost/disconnected errors
    #[error("Connection lost: {message}")]
    ConnectionLostError { message: String },

    /// The tool server process exited
    #[error("Process exited unexpectedly: exit code {}", code.map_or("unknown".to_string(), |c| c.to_string()))]
    ProcessExited { code: Option<i32> },
}

impl MCPOperationError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    /// Create a stdio transport error
    pub fn stdio(message: impl Into<String>) -> Self {
        Self::StdioError {
            message: message.into(),
        }
    }

    /// Create a network transport error
    pub fn http(message: impl Into<String>) -> Self {
        Self::HttpError {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create an initialization error
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::InitializationError {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: Duration) -> Self {
        Self::TimeoutError { duration }
    }

    /// Create an error from a JSON-RPC error reply
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create a tool-not-found error
    pub fn tool_not_found(tool_name: impl Into<String>) -> Self {
        Self::ToolNotFound {
            tool_name: tool_name.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::SessionError {
            message: message.into(),
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLostError {
            message: message.into(),
        }
    }

    /// Create a process exit error
    pub fn process_exited(code: Option<i32>) -> Self {
        Self::ProcessExited { code }
    }

    /// Whether the operation ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Whether the failure is tied to the underlying connection or process
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::TransportError { .. }
                | Self::StdioError { .. }
                | Self::HttpError { .. }
                | Self::ConnectionLostError { .. }
                | Self::ProcessExited { .. }
        )
    }

    /// Whether the Session that produced this error must be destroyed
    ///
    /// Spawn/connect failures, handshake failures and transport death leave the
    /// Session unusable; the next call should get a fresh one. Timeouts, server
    /// error replies and unknown tools do not.
    pub fn is_session_fatal(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                Self::InitializationError { .. } | Self::SessionError { .. }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = MCPOperationError::transport("Connection failed");
        assert!(matches!(error, MCPOperationError::TransportError { .. }));
        assert_eq!(error.to_string(), "Transport error: Connection failed");

        let error = MCPOperationError::server(-32601, "Method not found");
        assert_eq!(error.to_string(), "Server error [-32601]: Method not found");
    }

    #[test]
    fn test_process_exit_display() {
        assert_eq!(
            MCPOperationError::process_exited(Some(3)).to_string(),
            "Process exited unexpectedly: exit code 3"
        );
        assert_eq!(
            MCPOperationError::process_exited(None).to_string(),
            "Process exited unexpectedly: exit code unknown"
        );
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(MCPOperationError::connection_lost("gone").is_session_fatal());
        assert!(MCPOperationError::stdio("spawn failed").is_session_fatal());
        assert!(MCPOperationError::http("refused").is_session_fatal());
        assert!(MCPOperationError::initialization("bad handshake").is_session_fatal());

        assert!(!MCPOperationError::timeout(Duration::from_secs(1)).is_session_fatal());
        assert!(!MCPOperationError::server(-32000, "boom").is_session_fatal());
        assert!(!MCPOperationError::tool_not_found("missing").is_session_fatal());
    }
}

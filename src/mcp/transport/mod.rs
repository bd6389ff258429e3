//! Transport layer for tool-server communication channels
//!
//! This module connects the bridge to tool servers through two channels: local
//! processes spoken to over stdio, and network endpoints reached with one HTTP
//! round-trip per message.
//!
//! # Supported Transports
//!
//! ## Stdio Transport
//!
//! ```no_run
//! use toolbridge::mcp::transport::{StdioConfig, TransportFactory};
//!
//! let config = StdioConfig {
//!     command: "python".to_string(),
//!     args: vec!["-m".to_string(), "my_tool_server".to_string()],
//!     ..Default::default()
//! };
//!
//! let transport = TransportFactory::stdio(config);
//! ```
//!
//! ## HTTP Transport
//!
//! ```no_run
//! use toolbridge::mcp::transport::{HttpConfig, TransportFactory};
//!
//! let config = HttpConfig {
//!     url: "https://tools.example.com/mcp".to_string(),
//!     ..Default::default()
//! };
//!
//! let transport = TransportFactory::http(config).unwrap();
//! ```
//!
//! # Architecture
//!
//! 1. **Connect** - start the process or prepare the client, return message streams
//! 2. **Communicate** - exchange messages through the read stream and write sink
//! 3. **Disconnect** - stop cooperatively, force after the grace period
//!
//! The read stream yields decoded messages in receipt order. An `Err` item means
//! the transport is dead (the process exited or its pipes closed); the stream
//! ends right after it. The HTTP transport never yields `Err`: a failed round
//! trip becomes an error reply to the request that caused it.

mod http;
mod stdio;

pub use http::{HttpConfig, HttpTransport};
pub use stdio::{StdioConfig, StdioTransport};

use crate::config::{BridgeConfig, ServerConfig, TransportKind};
use crate::mcp::error::MCPOperationError;
use crate::mcp::types::MCPMessage;
use async_trait::async_trait;
use futures::sink::Sink;
use futures::stream::Stream;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Type alias for message streams
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<MCPMessage, MCPOperationError>> + Send>>;
pub type MessageSink = Pin<Box<dyn Sink<MCPMessage, Error = MCPOperationError> + Send>>;

/// Transport connection result containing read and write streams
pub struct TransportStreams {
    /// Stream for receiving messages from the tool server
    pub read_stream: MessageStream,
    /// Sink for sending messages to the tool server
    pub write_stream: MessageSink,
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams")
            .field("read_stream", &"<message_stream>")
            .field("write_stream", &"<message_sink>")
            .finish()
    }
}

/// Core trait for transport implementations
///
/// A transport owns the underlying channel (child process, HTTP client) while
/// the Session handles protocol-level concerns. A transport instance is
/// connected at most once; once disconnected it is never reused.
#[async_trait]
pub trait MCPTransport: Send + Sync {
    /// Establish the channel and return communication streams
    async fn connect(&mut self) -> Result<TransportStreams, MCPOperationError>;

    /// Stop the channel, cooperatively first and forcibly after the grace period
    async fn disconnect(&mut self) -> Result<(), MCPOperationError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get transport type and metadata
    fn transport_info(&self) -> TransportInfo;
}

/// Metadata about a transport
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Type of transport ("stdio" or "http")
    pub transport_type: String,
    /// Command line or URL
    pub endpoint: String,
}

/// Builds a fresh transport for a Session
///
/// The registry asks the provider for a new transport every time it creates a
/// Session, so tests can substitute in-process servers here.
pub trait TransportProvider: Send + Sync {
    fn create(
        &self,
        server: &ServerConfig,
        settings: &BridgeConfig,
    ) -> Result<Box<dyn MCPTransport>, MCPOperationError>;
}

/// Provider that spawns real processes and HTTP clients
#[derive(Debug, Default, Clone)]
pub struct DefaultTransportProvider;

impl TransportProvider for DefaultTransportProvider {
    fn create(
        &self,
        server: &ServerConfig,
        settings: &BridgeConfig,
    ) -> Result<Box<dyn MCPTransport>, MCPOperationError> {
        TransportFactory::for_server(server, settings)
    }
}

/// Factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    pub fn stdio(config: StdioConfig) -> Box<dyn MCPTransport> {
        Box::new(StdioTransport::new(config))
    }

    pub fn http(config: HttpConfig) -> Result<Box<dyn MCPTransport>, MCPOperationError> {
        Ok(Box::new(HttpTransport::new(config)?))
    }

    /// Build the transport described by a server definition
    pub fn for_server(
        server: &ServerConfig,
        settings: &BridgeConfig,
    ) -> Result<Box<dyn MCPTransport>, MCPOperationError> {
        let label = server.key().to_string();
        match server.transport {
            TransportKind::Stdio => {
                let command = server.command.clone().ok_or_else(|| {
                    MCPOperationError::stdio(format!("Server '{}' has no command", label))
                })?;
                Ok(Self::stdio(StdioConfig {
                    command,
                    args: server.args.clone(),
                    env_vars: server.env.clone(),
                    working_dir: server.working_dir.clone(),
                    shutdown_grace: settings.shutdown_grace,
                    label,
                }))
            }
            TransportKind::Http => {
                let url = server.url.clone().ok_or_else(|| {
                    MCPOperationError::http(format!("Server '{}' has no url", label))
                })?;
                Self::http(HttpConfig {
                    url,
                    headers: server.headers.clone(),
                    request_timeout: server.request_timeout(settings.request_timeout),
                    label,
                })
            }
        }
    }
}

fn channel_sink(tx: mpsc::UnboundedSender<MCPMessage>) -> MessageSink {
    Box::pin(futures::sink::unfold(tx, |tx, msg| async move {
        tx.send(msg)
            .map_err(|_| MCPOperationError::transport("Channel closed"))
            .map(|_| tx)
    }))
}

/// Create connected message streams for tests
///
/// Returns a sender that injects items into the read stream, a receiver that
/// captures everything written to the sink, and the streams themselves.
///
/// ```rust
/// use toolbridge::mcp::transport::create_test_streams;
/// use toolbridge::mcp::types::{MCPMessage, MCPRequest};
/// use serde_json::json;
///
/// let (read_tx, _write_rx, _streams) = create_test_streams();
/// let test_msg = MCPMessage::Request(MCPRequest::new(json!(1), "ping", None));
/// read_tx.send(Ok(test_msg)).unwrap();
/// ```
pub fn create_test_streams() -> (
    mpsc::UnboundedSender<Result<MCPMessage, MCPOperationError>>,
    mpsc::UnboundedReceiver<MCPMessage>,
    TransportStreams,
) {
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let streams = TransportStreams {
        read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(read_rx)),
        write_stream: channel_sink(write_tx),
    };

    (read_tx, write_rx, streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::MCPRequest;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;

    #[test]
    fn test_factory_rejects_incomplete_server() {
        let settings = BridgeConfig::default();

        let mut stdio = ServerConfig::stdio("owner", "files", "ignored", Vec::new());
        stdio.command = None;
        let err = TransportFactory::for_server(&stdio, &settings).err().unwrap();
        assert!(err.to_string().contains("no command"));

        let mut http = ServerConfig::http("owner", "web", "https://example.com/mcp");
        http.url = None;
        let err = TransportFactory::for_server(&http, &settings).err().unwrap();
        assert!(err.to_string().contains("no url"));
    }

    #[test]
    fn test_factory_builds_by_kind() {
        let settings = BridgeConfig::default();

        let stdio = ServerConfig::stdio("owner", "files", "cat", Vec::new());
        let transport = TransportFactory::for_server(&stdio, &settings).unwrap();
        assert_eq!(transport.transport_info().transport_type, "stdio");
        assert!(!transport.is_connected());

        let http = ServerConfig::http("owner", "web", "https://example.com/mcp");
        let transport = TransportFactory::for_server(&http, &settings).unwrap();
        let info = transport.transport_info();
        assert_eq!(info.transport_type, "http");
        assert_eq!(info.endpoint, "https://example.com/mcp");
    }

    #[tokio::test]
    async fn test_create_test_streams() {
        let (read_tx, mut write_rx, mut streams) = create_test_streams();

        let msg = MCPMessage::Request(MCPRequest::new(json!(1), "ping", None));
        read_tx.send(Ok(msg.clone())).unwrap();
        let received = streams.read_stream.next().await.unwrap().unwrap();
        assert_eq!(received, msg);

        streams.write_stream.send(msg.clone()).await.unwrap();
        assert_eq!(write_rx.recv().await.unwrap(), msg);
    }
}

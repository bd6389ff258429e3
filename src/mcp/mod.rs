//! JSON-RPC plumbing for talking to tool servers
//!
//! The layers stack bottom-up:
//!
//! - [`types`] - JSON-RPC 2.0 envelopes and the handshake and tool payloads
//! - [`codec`] - newline-delimited frames for stdio, bodies and event streams for HTTP
//! - [`transport`] - a child process or an HTTP endpoint exposed as a message stream and sink
//! - [`correlator`] - numeric request ids matched to waiting callers, with timeouts
//!
//! Nothing here knows about owners or namespacing; that lives in
//! [`crate::bridge`].
//!
//! ```no_run
//! use toolbridge::mcp::transport::{MCPTransport, StdioConfig, TransportFactory};
//!
//! # async fn example() -> Result<(), toolbridge::mcp::MCPOperationError> {
//! let mut transport = TransportFactory::stdio(StdioConfig {
//!     command: "my-tool-server".to_string(),
//!     ..Default::default()
//! });
//! let streams = transport.connect().await?;
//! # drop(streams);
//! transport.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod correlator;
pub mod error;
pub mod test_utils;
pub mod transport;
pub mod types;

pub use correlator::Correlator;
pub use error::MCPOperationError;
pub use transport::{
    DefaultTransportProvider, HttpConfig, HttpTransport, MCPTransport, StdioConfig,
    StdioTransport, TransportFactory, TransportInfo, TransportProvider, TransportStreams,
};
pub use types::*;

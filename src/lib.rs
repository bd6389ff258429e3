//! Bridge agent runtimes to external tool servers.
//!
//! Toolbridge spawns or connects to JSON-RPC tool servers (the Model Context
//! Protocol family) over stdio or HTTP, discovers their tools and exposes them
//! under namespaced names of the form `<server>__<tool>`. Many owners share one
//! bridge; each owner gets their own Session per configured server, created on
//! first use and closed after a period of inactivity.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use toolbridge::config::{BridgeConfig, InMemoryConfigStore, ServerConfig};
//! use toolbridge::ToolBridge;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryConfigStore::with_servers([ServerConfig::stdio(
//!         "alice",
//!         "files",
//!         "my-file-server",
//!         vec!["--root".to_string(), "/tmp".to_string()],
//!     )]));
//!     let bridge = ToolBridge::new(BridgeConfig::from_env()?, store)?;
//!
//!     for tool in bridge.list_tools("alice").await? {
//!         println!("{}: {}", tool.namespaced_name, tool.description);
//!     }
//!
//!     match bridge.invoke("alice", "files__read", json!({ "path": "a.txt" })).await? {
//!         Some(output) => println!("{}", output.text),
//!         None => println!("not a bridged tool"),
//!     }
//!
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Behaviour
//!
//! - Names without the `__` separator are not bridged: `invoke` returns `None`
//!   so the caller can try its other tool sources.
//! - Tool failures, timeouts and crashed servers come back as text with
//!   `is_error` set. A crashed server is replaced on the next call.
//! - Sessions close after `idle_timeout` without activity, never while a call
//!   is in flight.
//! - Shutting a server down sends a termination signal, waits `shutdown_grace`,
//!   then kills it.
//!
//! # Module Organization
//!
//! - [`bridge`] - dispatcher, session registry, sessions, discovery, recording
//! - [`mcp`] - wire types, codec, transports and request correlation
//! - [`config`] - bridge settings and the server definition store
//! - [`error`] - errors surfaced by the public API
//! - [`utils`] - logging setup

pub mod bridge;
pub mod config;
pub mod error;
pub mod mcp;
pub mod utils;

pub use bridge::{ToolBridge, ToolOutput};
pub use error::BridgeError;

pub type Result<T> = std::result::Result<T, BridgeError>;

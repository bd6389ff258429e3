//! Owner-scoped sessions with namespaced tools
//!
//! - [`dispatcher`] - [`ToolBridge`], the entry point agents call
//! - [`registry`] - at most one live [`Session`] per owner and server, idle reaping
//! - [`session`] - handshake, tool calls and teardown for one connection
//! - [`discovery`] - `tools/list` paging and `<server>__<tool>` naming
//! - [`recording`] - optional frame capture after each action

pub mod discovery;
pub mod dispatcher;
pub mod recording;
pub mod registry;
pub mod session;

pub use discovery::{namespaced_name, sanitize_server_name, split_namespaced, ToolDefinition, SEPARATOR};
pub use dispatcher::{ToolBridge, ToolOutput};
pub use recording::{Frame, RecordingSummary};
pub use registry::SessionRegistry;
pub use session::{Session, SessionKey, SessionSnapshot, SessionState};

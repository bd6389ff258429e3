//! Protocol message types and data structures
//!
//! This module provides the JSON-RPC envelope spoken with tool servers and the
//! payload types of the three methods the bridge relies on: `initialize`,
//! `tools/list` and `tools/call`.
//!
//! # Message Types
//!
//! ```rust
//! use toolbridge::mcp::types::{MCPRequest, MCPResponse, MCPNotification};
//! use serde_json::json;
//!
//! let request = MCPRequest::new(json!(1), "tools/list", None);
//! let response = MCPResponse::success(json!(1), json!({"tools": []}));
//! let notification = MCPNotification::new("notifications/initialized", None);
//! ```
//!
//! # Content Types
//!
//! Tool results carry a list of typed content items. Text items make up the
//! textual result; images and embedded resources travel on a side channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// Unique identifier for JSON-RPC requests
pub type RequestId = Value;

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Core message variants following JSON-RPC 2.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MCPMessage {
    /// A request message initiating an operation
    Request(MCPRequest),
    /// A response message containing results or errors
    Response(MCPResponse),
    /// A notification message (request without expecting response)
    Notification(MCPNotification),
}

/// Request message for initiating operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPRequest {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Unique identifier for this request
    pub id: RequestId,
    /// Method name to invoke
    pub method: String,
    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl MCPRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response message containing operation results or errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPResponse {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Either result or error, but not both
    #[serde(flatten)]
    pub payload: MCPResponsePayload,
}

impl MCPResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            payload: MCPResponsePayload::Success { result },
        }
    }

    pub fn error(id: RequestId, error: MCPError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            payload: MCPResponsePayload::Error { error },
        }
    }

    /// Numeric correlation id, accepting ids echoed back as numeric strings
    pub fn numeric_id(&self) -> Option<u64> {
        match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Response content - either successful result data or error details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MCPResponsePayload {
    /// Error response with error details
    Error { error: MCPError },
    /// Successful response with result data
    Success { result: Value },
}

/// Notification message for events that don't expect responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPNotification {
    /// JSON-RPC version (always "2.0")
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl MCPNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// Error information following JSON-RPC 2.0 error format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPError {
    /// Numeric error code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC 2.0 error codes
impl MCPError {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Implementation-defined code for a failed network round-trip
    pub const TRANSPORT_FAILURE: i32 = -32000;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("Method not found: {}", method.into()),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::new(Self::TRANSPORT_FAILURE, message)
    }
}

/// Server feature support advertised during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

/// Tool-related server capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolsCapability {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "listChanged")]
    pub list_changed: Option<bool>,
}

/// Client feature support declared during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
}

/// Root directory-related client capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RootsCapability {
    #[serde(skip_serializing_if = "Option::is_none", rename = "listChanged")]
    pub list_changed: Option<bool>,
}

/// Name and version of either side of the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Implementation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Initialize request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// Initialize response result
///
/// Every field is optional on decode; servers in the wild omit parts of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<Implementation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Tool metadata including name, description, and parameter schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Name of the tool
    pub name: String,
    /// Description of what the tool does
    #[serde(default)]
    pub description: String,
    /// JSON schema for the tool's input parameters
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One page of a `tools/list` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Content formats for tool results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text(TextContent),
    #[serde(rename = "image")]
    Image(ImageContent),
    #[serde(rename = "resource")]
    Resource(ResourceContent),
    /// Any content type this bridge does not interpret
    #[serde(other)]
    Unsupported,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(TextContent { text: text.into() })
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Content::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// Image content type with base64 encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// Base64-encoded image data
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Embedded resource content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub resource: EmbeddedResource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Tool execution results containing content and error status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "isError")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: None,
        }
    }

    /// Concatenation of every text content item, in order
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

//! Tool discovery and namespacing
//!
//! After the handshake the Session lists the server's tools and turns each
//! remote descriptor into a [`ToolDefinition`] whose name is prefixed with the
//! sanitized server name: `files__read`, `search__read`. Two servers exposing
//! a tool with the same raw name therefore never collide for one owner.

use crate::mcp::correlator::Correlator;
use crate::mcp::error::MCPOperationError;
use crate::mcp::types::{ListToolsResult, Tool};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Joins the server prefix and the raw tool name
pub const SEPARATOR: &str = "__";

/// Upper bound on `tools/list` pages, in case a server loops its cursor
const MAX_PAGES: usize = 100;

/// A remote tool as seen by callers of the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub namespaced_name: String,
    pub raw_name: String,
    pub description: String,
    pub parameter_schema: Value,
}

impl ToolDefinition {
    pub fn from_tool(namespace: &str, tool: Tool) -> Self {
        Self {
            namespaced_name: namespaced_name(namespace, &tool.name),
            raw_name: tool.name,
            description: tool.description,
            parameter_schema: tool.input_schema,
        }
    }
}

/// Identifier-safe form of a server name
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, runs of `_` collapse, and
/// leading/trailing `_` are trimmed. The result never contains the separator.
pub fn sanitize_server_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches('_').to_string()
}

pub fn namespaced_name(namespace: &str, raw_name: &str) -> String {
    format!("{}{}{}", namespace, SEPARATOR, raw_name)
}

/// Split `server__tool` at the first separator
///
/// Returns `None` when the name is not namespaced or either side is empty.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Fetch every page of `tools/list`
pub async fn discover_tools(
    correlator: &Correlator,
    timeout: Duration,
) -> Result<Vec<Tool>, MCPOperationError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for page in 0..MAX_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let result = correlator.call("tools/list", params, timeout).await?;
        let listed: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            MCPOperationError::protocol(format!("Invalid tools/list result: {}", e))
        })?;

        debug!(page, count = listed.tools.len(), "Received tools page");
        tools.extend(listed.tools);

        match listed.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }

    warn!(pages = MAX_PAGES, "Stopped paginating tools/list");
    Ok(tools)
}

/// Namespace a discovered tool list, dropping duplicate raw names
pub fn build_tool_definitions(namespace: &str, tools: Vec<Tool>) -> Vec<ToolDefinition> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|tool| {
            if tool.name.is_empty() {
                return false;
            }
            if !seen.insert(tool.name.clone()) {
                warn!(namespace, tool = %tool.name, "Ignoring duplicate tool name");
                return false;
            }
            true
        })
        .map(|tool| ToolDefinition::from_tool(namespace, tool))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::{MCPMessage, MCPResponse};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_sanitize_server_name() {
        assert_eq!(sanitize_server_name("files"), "files");
        assert_eq!(sanitize_server_name("My Files!"), "My_Files");
        assert_eq!(sanitize_server_name("a__b"), "a_b");
        assert_eq!(sanitize_server_name("__x__"), "x");
        assert_eq!(sanitize_server_name("web-search.v2"), "web-search_v2");
        assert_eq!(sanitize_server_name("!!!"), "");
        assert!(!sanitize_server_name("a  __  b").contains(SEPARATOR));
    }

    #[test]
    fn test_split_namespaced() {
        assert_eq!(split_namespaced("srv__echo"), Some(("srv", "echo")));
        assert_eq!(split_namespaced("srv__do__thing"), Some(("srv", "do__thing")));
        assert_eq!(split_namespaced("echo"), None);
        assert_eq!(split_namespaced("srv_echo"), None);
        assert_eq!(split_namespaced("__echo"), None);
        assert_eq!(split_namespaced("srv__"), None);
    }

    #[test]
    fn test_same_raw_name_on_two_servers() {
        let a = build_tool_definitions("a", vec![tool("run")]);
        let b = build_tool_definitions("b", vec![tool("run")]);
        assert_eq!(a[0].namespaced_name, "a__run");
        assert_eq!(b[0].namespaced_name, "b__run");
        assert_ne!(a[0].namespaced_name, b[0].namespaced_name);
        assert_eq!(a[0].raw_name, b[0].raw_name);
        assert_eq!(a[0].description, "run tool");
    }

    #[test]
    fn test_duplicates_and_unnamed_dropped() {
        let defs = build_tool_definitions("s", vec![tool("x"), tool(""), tool("x"), tool("y")]);
        let names: Vec<_> = defs.iter().map(|d| d.raw_name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_discovery_follows_cursor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx));

        let server = correlator.clone();
        tokio::spawn(async move {
            while let Some(MCPMessage::Request(request)) = rx.recv().await {
                let page = match request.params.as_ref().and_then(|p| p.get("cursor")) {
                    None => json!({"tools": [{"name": "one"}], "nextCursor": "p2"}),
                    Some(_) => json!({"tools": [{"name": "two"}]}),
                };
                server.resolve(MCPResponse::success(request.id, page)).await;
            }
        });

        let tools = discover_tools(&correlator, Duration::from_secs(5)).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }
}

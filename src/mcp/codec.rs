//! Wire framing for both transports
//!
//! The process transport speaks newline-delimited JSON: one message per line.
//! The network transport carries one message per request body, and a reply body
//! may hold a single message, a JSON batch array, or an event stream whose
//! `data:` lines each carry one message.
//!
//! Decoding never fails loudly. Input that is not a protocol message is noise
//! (partial writes, log lines printed to stdout by a careless server) and is
//! dropped with a trace-level log.

use crate::mcp::error::MCPOperationError;
use crate::mcp::types::MCPMessage;
use serde_json::Value;
use tracing::trace;

/// Encode a message as one newline-terminated line
pub fn encode_frame(message: &MCPMessage) -> Result<String, MCPOperationError> {
    let mut line = encode_body(message)?;
    line.push('\n');
    Ok(line)
}

/// Encode a message as a standalone request body
pub fn encode_body(message: &MCPMessage) -> Result<String, MCPOperationError> {
    serde_json::to_string(message)
        .map_err(|e| MCPOperationError::serialization(format!("Failed to encode message: {}", e)))
}

/// Decode one line of a line-delimited stream
///
/// Returns `None` for blank lines and anything that is not a protocol message.
pub fn decode_frame(line: &str) -> Option<MCPMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<MCPMessage>(trimmed) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!(error = %e, line_len = trimmed.len(), "Dropping undecodable frame");
            None
        }
    }
}

/// Decode a network reply body into zero or more messages
pub fn decode_body(content_type: Option<&str>, body: &str) -> Vec<MCPMessage> {
    let is_event_stream = content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        return decode_event_stream(body);
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items.into_iter().filter_map(decode_value).collect(),
        Ok(value) => decode_value(value).into_iter().collect(),
        // Some servers answer with an event stream without labelling it
        Err(_) if trimmed.starts_with("data:") || trimmed.starts_with("event:") => {
            decode_event_stream(body)
        }
        Err(e) => {
            trace!(error = %e, body_len = trimmed.len(), "Dropping undecodable body");
            Vec::new()
        }
    }
}

fn decode_value(value: Value) -> Option<MCPMessage> {
    match serde_json::from_value::<MCPMessage>(value) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!(error = %e, "Dropping non-message JSON value");
            None
        }
    }
}

fn decode_event_stream(body: &str) -> Vec<MCPMessage> {
    let mut messages = Vec::new();
    let mut data = String::new();

    for line in body.lines().chain(std::iter::once("")) {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.trim().is_empty() && !data.is_empty() {
            if let Some(message) = decode_frame(&data) {
                messages.push(message);
            }
            data.clear();
        }
    }

    messages
}

//! Invocation dispatcher: the public entry point of the bridge
//!
//! [`ToolBridge::invoke`] takes a namespaced tool name such as `files__read`,
//! finds the owner's server whose namespace is `files`, makes sure a Session
//! is ready and calls `read` on it. Tool failures come back as text so the
//! calling agent can reason about them; only "not mine" (`None`) and an
//! unreachable configuration store are signalled out of band.

use crate::bridge::discovery::{namespaced_name, split_namespaced, ToolDefinition};
use crate::bridge::recording::Frame;
use crate::bridge::registry::SessionRegistry;
use crate::bridge::session::{Session, SessionKey, SessionSnapshot};
use crate::config::{BridgeConfig, ConfigStore, ServerConfig};
use crate::error::BridgeError;
use crate::mcp::error::MCPOperationError;
use crate::mcp::transport::{DefaultTransportProvider, TransportProvider};
use crate::mcp::types::{CallToolResult, Content};
use crate::Result;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Closes the caller's Session for that server
pub const CLOSE_SESSION_TOOL: &str = "close_session";
/// Turns frame recording on (servers with recording configured)
pub const START_RECORDING_TOOL: &str = "start_recording";
/// Turns frame recording off and returns the summary
pub const STOP_RECORDING_TOOL: &str = "stop_recording";

/// Result of a tool invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    /// Concatenated text content, or a description of what went wrong
    pub text: String,
    /// Non-text content (images, embedded resources)
    pub attachments: Vec<Content>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            is_error: true,
        }
    }

    pub fn from_result(result: CallToolResult) -> Self {
        let text = result.joined_text();
        let attachments = result
            .content
            .into_iter()
            .filter(|c| matches!(c, Content::Image(_) | Content::Resource(_)))
            .collect();
        Self {
            text,
            attachments,
            is_error: result.is_error.unwrap_or(false),
        }
    }
}

fn describe_failure(config: &ServerConfig, tool: &str, error: &MCPOperationError) -> String {
    let server = &config.server_name;
    match error {
        MCPOperationError::ToolNotFound { tool_name } => {
            format!("Error: server '{}' has no tool named '{}'", server, tool_name)
        }
        MCPOperationError::TimeoutError { duration } => format!(
            "Error: tool '{}' on server '{}' did not respond within {:.1}s",
            tool,
            server,
            duration.as_secs_f64()
        ),
        e if e.is_session_fatal() => format!(
            "Error: server '{}' is unavailable ({}). The connection was reset; the next call will start a new session.",
            server, e
        ),
        e => format!("Error: tool '{}' on server '{}' failed: {}", tool, server, e),
    }
}

/// Bridge between agent runtimes and external tool servers
pub struct ToolBridge {
    store: Arc<dyn ConfigStore>,
    registry: SessionRegistry,
}

impl ToolBridge {
    /// Bridge spawning real processes and HTTP clients
    pub fn new(settings: BridgeConfig, store: Arc<dyn ConfigStore>) -> Result<Self> {
        Self::with_provider(settings, store, Arc::new(DefaultTransportProvider))
    }

    pub fn with_provider(
        settings: BridgeConfig,
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            store,
            registry: SessionRegistry::new(settings, provider),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Invoke a namespaced tool on behalf of an owner
    ///
    /// Returns `Ok(None)` when the name is not namespaced: the tool belongs to
    /// some other bridge. Every failure of the tool itself is `Ok(Some(_))`
    /// with `is_error` set.
    pub async fn invoke(
        &self,
        owner_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Option<ToolOutput>> {
        let Some((namespace, raw_name)) = split_namespaced(tool_name) else {
            return Ok(None);
        };

        let Some(config) = self.resolve_server(owner_id, namespace).await? else {
            debug!(owner = %owner_id, namespace, "No server for tool namespace");
            return Ok(Some(ToolOutput::error(format!(
                "Error: no such server '{}' is configured; cannot run tool '{}'",
                namespace, tool_name
            ))));
        };

        let span = info_span!("invoke", owner = %owner_id, server = %config.server_name, tool = %raw_name);
        let output = self
            .dispatch(&config, raw_name, normalize_arguments(arguments))
            .instrument(span)
            .await;
        Ok(Some(output))
    }

    async fn dispatch(&self, config: &ServerConfig, raw_name: &str, arguments: Value) -> ToolOutput {
        if raw_name == CLOSE_SESSION_TOOL {
            return self.close_session_tool(config).await;
        }
        if config.recording.is_some() {
            match raw_name {
                START_RECORDING_TOOL => return self.start_recording_tool(config).await,
                STOP_RECORDING_TOOL => return self.stop_recording_tool(config).await,
                _ => {}
            }
        }

        let session = match self.ready_session(config).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not establish session");
                return ToolOutput::error(describe_failure(config, raw_name, &e));
            }
        };

        match session.call_tool(raw_name, arguments).await {
            Ok(result) => {
                let output = ToolOutput::from_result(result);
                if !output.is_error {
                    self.capture_after(&session, config, raw_name).await;
                }
                output
            }
            Err(e) => {
                if e.is_session_fatal() {
                    self.registry.discard(&session).await;
                }
                warn!(error = %e, "Tool call failed");
                ToolOutput::error(describe_failure(config, raw_name, &e))
            }
        }
    }

    /// A ready Session with a freshly reset idle timer
    async fn ready_session(
        &self,
        config: &ServerConfig,
    ) -> std::result::Result<Arc<Session>, MCPOperationError> {
        let session = self.registry.get_or_create(config).await?;
        if self.registry.touch(&session) {
            return Ok(session);
        }
        // Lost a race with the idle reaper or a crash; one fresh attempt
        let session = self.registry.get_or_create(config).await?;
        self.registry.touch(&session);
        Ok(session)
    }

    async fn resolve_server(&self, owner_id: &str, namespace: &str) -> Result<Option<ServerConfig>> {
        if let Some(session) = self.registry.find_by_namespace(owner_id, namespace) {
            return Ok(Some(session.config().clone()));
        }
        let servers = self.store.servers(owner_id).await?;
        Ok(servers.into_iter().find(|s| s.namespace() == namespace))
    }

    /// Best-effort capture after a successful action while recording
    async fn capture_after(&self, session: &Arc<Session>, config: &ServerConfig, raw_name: &str) {
        let Some(capture) = &config.recording else {
            return;
        };
        if raw_name == capture.capture_tool {
            return;
        }
        let Some(recording) = self.registry.existing_recording(session.key()) else {
            return;
        };
        if !recording.lock().await.is_active() {
            return;
        }

        match session
            .call_tool(&capture.capture_tool, capture.capture_arguments.clone())
            .await
        {
            Ok(result) if !result.is_error.unwrap_or(false) => {
                let output = ToolOutput::from_result(result);
                recording.lock().await.push(Frame {
                    captured_at: Utc::now(),
                    after_tool: raw_name.to_string(),
                    text: output.text,
                    attachments: output.attachments,
                });
            }
            Ok(result) => {
                warn!(capture_tool = %capture.capture_tool, text = %result.joined_text(), "Capture call reported an error");
                recording.lock().await.record_failure();
            }
            Err(e) => {
                warn!(capture_tool = %capture.capture_tool, error = %e, "Capture call failed");
                recording.lock().await.record_failure();
            }
        }
    }

    async fn close_session_tool(&self, config: &ServerConfig) -> ToolOutput {
        if self.registry.remove(&config.key()).await {
            ToolOutput::text(format!("Session for server '{}' closed.", config.server_name))
        } else {
            ToolOutput::text(format!("No active session for server '{}'.", config.server_name))
        }
    }

    async fn start_recording_tool(&self, config: &ServerConfig) -> ToolOutput {
        let session = match self.ready_session(config).await {
            Ok(session) => session,
            Err(e) => return ToolOutput::error(describe_failure(config, START_RECORDING_TOOL, &e)),
        };
        let started = self.registry.recording(session.key()).lock().await.start();
        if started {
            info!("Recording started");
            ToolOutput::text(format!(
                "Recording started for server '{}'. A frame is captured after every action.",
                config.server_name
            ))
        } else {
            ToolOutput::text(format!("Recording is already active for server '{}'.", config.server_name))
        }
    }

    async fn stop_recording_tool(&self, config: &ServerConfig) -> ToolOutput {
        // Recording state outlives Session replacement, so no live Session is needed
        let summary = match self.registry.existing_recording(&config.key()) {
            Some(recording) => recording.lock().await.stop(),
            None => None,
        };
        match summary {
            Some(summary) => {
                info!(frames = summary.frames.len(), "Recording stopped");
                ToolOutput {
                    text: summary.describe(),
                    attachments: summary.attachments(),
                    is_error: false,
                }
            }
            None => ToolOutput::text(format!(
                "Recording is not active for server '{}'.",
                config.server_name
            )),
        }
    }

    /// Namespaced tools of every server the owner configured, plus control tools
    ///
    /// Servers are connected concurrently; one that fails is logged and left out.
    pub async fn list_tools(&self, owner_id: &str) -> Result<Vec<ToolDefinition>> {
        let servers = self.store.servers(owner_id).await?;
        let sessions = join_all(servers.iter().map(|s| self.ready_session(s))).await;

        let mut tools = Vec::new();
        for (config, session) in servers.iter().zip(sessions) {
            match session {
                Ok(session) => tools.extend(session.tools()),
                Err(e) => warn!(owner = %owner_id, server = %config.server_name, error = %e, "Skipping server that failed to connect"),
            }
            tools.extend(control_tools(config));
        }
        Ok(tools)
    }

    /// Store a new server definition
    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        if self.store.get(&config.owner_id, &config.server_name).await?.is_some() {
            return Err(BridgeError::configuration(format!(
                "Server '{}' already exists for owner '{}'",
                config.server_name, config.owner_id
            )));
        }
        self.check_namespace(&config).await?;
        info!(owner = %config.owner_id, server = %config.server_name, "Adding server");
        self.store.put(config).await?;
        Ok(())
    }

    /// Replace a server definition, disconnecting its live Session first
    pub async fn update_server(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        if self.store.get(&config.owner_id, &config.server_name).await?.is_none() {
            return Err(BridgeError::unknown_server(&config.owner_id, &config.server_name));
        }
        self.check_namespace(&config).await?;
        self.registry.remove(&config.key()).await;
        info!(owner = %config.owner_id, server = %config.server_name, "Updating server");
        self.store.put(config).await?;
        Ok(())
    }

    /// Remove a server definition, disconnecting its live Session first
    pub async fn remove_server(&self, owner_id: &str, server_name: &str) -> Result<bool> {
        let key = SessionKey::new(owner_id, server_name);
        self.registry.remove(&key).await;
        self.registry.drop_recording(&key);
        let removed = self.store.remove(owner_id, server_name).await?.is_some();
        if removed {
            info!(owner = %owner_id, server = %server_name, "Removed server");
        }
        Ok(removed)
    }

    pub async fn servers(&self, owner_id: &str) -> Result<Vec<ServerConfig>> {
        Ok(self.store.servers(owner_id).await?)
    }

    /// Two servers of one owner must not share a namespace
    async fn check_namespace(&self, config: &ServerConfig) -> Result<()> {
        let namespace = config.namespace();
        let clash = self
            .store
            .servers(&config.owner_id)
            .await?
            .into_iter()
            .find(|s| s.server_name != config.server_name && s.namespace() == namespace);
        match clash {
            Some(other) => Err(BridgeError::configuration(format!(
                "Server '{}' would share the tool prefix '{}' with server '{}'",
                config.server_name, namespace, other.server_name
            ))),
            None => Ok(()),
        }
    }

    /// Close one Session; returns whether it was live
    pub async fn disconnect(&self, owner_id: &str, server_name: &str) -> bool {
        let key = SessionKey::new(owner_id, server_name);
        self.registry.remove(&key).await
    }

    /// Close every Session of an owner
    pub async fn disconnect_owner(&self, owner_id: &str) -> usize {
        self.registry.close_all(owner_id).await
    }

    /// Close every Session of every owner
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    pub async fn live_sessions(&self, owner_id: &str) -> Vec<SessionSnapshot> {
        self.registry.live_sessions(owner_id).await
    }
}

fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => json!({}),
        other => other,
    }
}

fn control_tools(config: &ServerConfig) -> Vec<ToolDefinition> {
    let namespace = config.namespace();
    let empty_schema = json!({ "type": "object", "properties": {} });
    let mut tools = vec![ToolDefinition {
        namespaced_name: namespaced_name(&namespace, CLOSE_SESSION_TOOL),
        raw_name: CLOSE_SESSION_TOOL.to_string(),
        description: format!(
            "Close the connection to '{}' now. The next call reconnects.",
            config.server_name
        ),
        parameter_schema: empty_schema.clone(),
    }];
    if config.recording.is_some() {
        tools.push(ToolDefinition {
            namespaced_name: namespaced_name(&namespace, START_RECORDING_TOOL),
            raw_name: START_RECORDING_TOOL.to_string(),
            description: "Capture a frame after every subsequent action.".to_string(),
            parameter_schema: empty_schema.clone(),
        });
        tools.push(ToolDefinition {
            namespaced_name: namespaced_name(&namespace, STOP_RECORDING_TOOL),
            raw_name: STOP_RECORDING_TOOL.to_string(),
            description: "Stop capturing frames and return what was recorded.".to_string(),
            parameter_schema: empty_schema,
        });
    }
    tools
}

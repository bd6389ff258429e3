//! One live connection to one tool server for one owner
//!
//! A Session owns a transport, the correlator multiplexing calls over it, the
//! tool list discovered during the handshake, and its idle timer. A background
//! pump task moves messages between the transport and the correlator and
//! answers the few requests a server may send on its own.
//!
//! ```text
//! Uninitialized -> Handshaking -> Ready -> Closing -> Closed
//!                       |           |                  ^
//!                       +-----------+------------------+  (failure, transport death)
//! ```
//!
//! A transport that has been torn down is never reused: recovering from any
//! failure means building a new Session.

use crate::bridge::discovery::{build_tool_definitions, discover_tools, ToolDefinition};
use crate::config::{BridgeConfig, ServerConfig};
use crate::mcp::correlator::Correlator;
use crate::mcp::error::MCPOperationError;
use crate::mcp::transport::{MCPTransport, TransportInfo, TransportStreams};
use crate::mcp::types::{
    CallToolResult, ClientCapabilities, Implementation, InitializeParams, InitializeResult, MCPError,
    MCPMessage, MCPResponse,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Registry key: one Session per owner and server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub owner_id: String,
    pub server_name: String,
}

impl SessionKey {
    pub fn new(owner_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            server_name: server_name.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.server_name)
    }
}

/// Lifecycle state of a Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Handshaking = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Handshaking,
            2 => Self::Ready,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Called from the pump when the transport dies on its own
pub type TerminationHook = Arc<dyn Fn(&SessionKey, Uuid) + Send + Sync>;

/// Point-in-time view of a Session for introspection
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub session_id: Uuid,
    pub state: SessionState,
    pub transport: String,
    pub tool_count: usize,
    pub created_at: DateTime<Utc>,
    pub idle_for_ms: u64,
    pub recording: bool,
}

pub struct Session {
    key: SessionKey,
    id: Uuid,
    config: Arc<ServerConfig>,
    request_timeout: Duration,
    info: TransportInfo,
    state: AtomicU8,
    transport: tokio::sync::Mutex<Box<dyn MCPTransport>>,
    correlator: Arc<Correlator>,
    tools: RwLock<Vec<ToolDefinition>>,
    server_info: RwLock<Option<Implementation>>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("transport", &self.info.transport_type)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Start the transport, run the handshake and discover tools
    ///
    /// On failure the transport is stopped before returning; nothing of the
    /// Session outlives the error.
    pub async fn connect(
        config: Arc<ServerConfig>,
        settings: &BridgeConfig,
        transport: Box<dyn MCPTransport>,
        on_terminated: TerminationHook,
    ) -> Result<Arc<Session>, MCPOperationError> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let info = transport.transport_info();
        let session = Arc::new(Session {
            key: config.key(),
            id: Uuid::new_v4(),
            request_timeout: config.request_timeout(settings.request_timeout),
            config,
            info,
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            transport: tokio::sync::Mutex::new(transport),
            correlator: Arc::new(Correlator::new(outgoing_tx)),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            idle_timer: Mutex::new(None),
            pump: Mutex::new(None),
        });

        debug!(
            session = %session.key,
            session_id = %session.id,
            transport = %session.info.transport_type,
            endpoint = %session.info.endpoint,
            "Starting session"
        );
        session.set_state(SessionState::Handshaking);

        let streams = {
            let mut transport = session.transport.lock().await;
            match transport.connect().await {
                Ok(streams) => streams,
                Err(e) => {
                    session.set_state(SessionState::Closed);
                    warn!(session = %session.key, error = %e, "Failed to start transport");
                    return Err(e);
                }
            }
        };

        let pump = tokio::spawn(run_pump(
            streams,
            outgoing_rx,
            Arc::clone(&session.correlator),
            Arc::downgrade(&session),
            on_terminated,
        ));
        *lock(&session.pump) = Some(pump);

        let handshake = tokio::time::timeout(
            settings.handshake_timeout,
            session.handshake(settings),
        )
        .await
        .unwrap_or_else(|_| Err(MCPOperationError::timeout(settings.handshake_timeout)));

        match handshake {
            Ok(()) => {
                if !session.transition(SessionState::Handshaking, SessionState::Ready) {
                    // The transport died between the last reply and now
                    session.close().await;
                    return Err(MCPOperationError::initialization(format!(
                        "Session {} terminated during handshake",
                        session.key
                    )));
                }
                info!(
                    session = %session.key,
                    session_id = %session.id,
                    tools = session.tool_count(),
                    "Session ready"
                );
                Ok(session)
            }
            Err(e) => {
                warn!(session = %session.key, error = %e, "Handshake failed");
                session.close().await;
                Err(MCPOperationError::initialization(format!(
                    "Handshake with server '{}' failed: {}",
                    session.key.server_name, e
                )))
            }
        }
    }

    async fn handshake(&self, settings: &BridgeConfig) -> Result<(), MCPOperationError> {
        let params = InitializeParams {
            protocol_version: settings.protocol_version.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: settings.client_name.clone(),
                version: settings.client_version.clone(),
            },
        };
        let params = serde_json::to_value(params)
            .map_err(|e| MCPOperationError::serialization(e.to_string()))?;

        let result = self
            .correlator
            .call("initialize", Some(params), settings.handshake_timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            MCPOperationError::protocol(format!("Invalid initialize result: {}", e))
        })?;

        if let Some(version) = &init.protocol_version {
            if version != &settings.protocol_version {
                debug!(session = %self.key, server_version = %version, "Server negotiated a different protocol version");
            }
        }
        *self.server_info.write().unwrap_or_else(PoisonError::into_inner) = init.server_info.clone();

        self.correlator.notify("notifications/initialized", None)?;

        let tools = match discover_tools(&self.correlator, settings.handshake_timeout).await {
            Ok(tools) => tools,
            Err(MCPOperationError::ServerError { code, message })
                if init.capabilities.tools.is_none() =>
            {
                debug!(session = %self.key, code, message = %message, "Server has no tools capability");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let definitions = build_tool_definitions(&self.config.namespace(), tools);
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = definitions;
        Ok(())
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `to` unless already closing or closed
    fn begin_shutdown(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Discovered tools, namespaced
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn has_tool(&self, raw_name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t.raw_name == raw_name)
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transport_info(&self) -> &TransportInfo {
        &self.info
    }

    pub async fn pending_requests(&self) -> usize {
        self.correlator.pending_count().await
    }

    pub fn mark_activity(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Install a new idle timer, cancelling the previous one
    pub(crate) fn replace_idle_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = lock(&self.idle_timer).replace(timer) {
            previous.abort();
        }
    }

    /// Detach the running idle timer without cancelling it
    pub(crate) fn detach_idle_timer(&self) {
        lock(&self.idle_timer).take();
    }

    /// Call a discovered tool by its raw name
    pub async fn call_tool(
        &self,
        raw_name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, MCPOperationError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(MCPOperationError::session(format!(
                "Session {} is {}",
                self.key, state
            )));
        }
        if !self.has_tool(raw_name) {
            return Err(MCPOperationError::tool_not_found(raw_name));
        }

        let params = json!({ "name": raw_name, "arguments": arguments });
        let result = self
            .correlator
            .call("tools/call", Some(params), self.request_timeout)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| MCPOperationError::protocol(format!("Invalid tools/call result: {}", e)))
    }

    /// Close the Session: reject pending calls and stop the transport
    ///
    /// Idempotent. Does not touch the registry.
    pub async fn close(&self) {
        if !self.begin_shutdown(SessionState::Closing) {
            return;
        }
        if let Some(timer) = lock(&self.idle_timer).take() {
            timer.abort();
        }

        let rejected = self
            .correlator
            .terminate(MCPOperationError::session(format!(
                "Session {} closed",
                self.key
            )))
            .await;

        {
            let mut transport = self.transport.lock().await;
            if let Err(e) = transport.disconnect().await {
                warn!(session = %self.key, error = %e, "Error while stopping transport");
            }
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }

        self.set_state(SessionState::Closed);
        info!(session = %self.key, session_id = %self.id, rejected, "Session closed");
    }

    /// Handle transport death reported by the pump
    async fn terminated(&self, reason: &MCPOperationError, hook: &TerminationHook) {
        if !self.begin_shutdown(SessionState::Closed) {
            return;
        }
        warn!(session = %self.key, session_id = %self.id, reason = %reason, "Session transport terminated");
        if let Some(timer) = lock(&self.idle_timer).take() {
            timer.abort();
        }
        hook(&self.key, self.id);

        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.disconnect().await {
            debug!(session = %self.key, error = %e, "Error releasing dead transport");
        }
    }

    /// `recording` comes from the registry, which owns recording state
    pub fn snapshot(&self, recording: bool) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            session_id: self.id,
            state: self.state(),
            transport: self.info.transport_type.clone(),
            tool_count: self.tool_count(),
            created_at: self.created_at,
            idle_for_ms: self.idle_for().as_millis() as u64,
            recording,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
        if let Some(pump) = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }
}

async fn run_pump(
    mut streams: TransportStreams,
    mut outgoing: mpsc::UnboundedReceiver<MCPMessage>,
    correlator: Arc<Correlator>,
    session: Weak<Session>,
    on_terminated: TerminationHook,
) {
    let reason = loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = streams.write_stream.send(message).await {
                        break e;
                    }
                }
                None => break MCPOperationError::connection_lost("Session dropped"),
            },
            incoming = streams.read_stream.next() => match incoming {
                Some(Ok(message)) => handle_incoming(&correlator, message).await,
                Some(Err(e)) => break e,
                None => break MCPOperationError::connection_lost("Transport stream ended"),
            },
        }
    };

    let rejected = correlator.terminate(reason.clone()).await;
    trace!(rejected, reason = %reason, "Pump stopped");
    if let Some(session) = session.upgrade() {
        session.terminated(&reason, &on_terminated).await;
    }
}

async fn handle_incoming(correlator: &Correlator, message: MCPMessage) {
    match message {
        MCPMessage::Response(response) => {
            correlator.resolve(response).await;
        }
        MCPMessage::Request(request) => {
            let reply = if request.method == "ping" {
                MCPResponse::success(request.id, json!({}))
            } else {
                debug!(method = %request.method, "Rejecting server-initiated request");
                MCPResponse::error(request.id, MCPError::method_not_found(&request.method))
            };
            if let Err(e) = correlator.send_raw(MCPMessage::Response(reply)) {
                debug!(error = %e, "Could not answer server request");
            }
        }
        MCPMessage::Notification(notification) => {
            debug!(method = %notification.method, "Server notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_utils::{MockReply, MockToolServer, MockTransportProvider};
    use crate::mcp::transport::TransportProvider;
    use crate::mcp::types::{MCPRequest, MCPResponsePayload};
    use std::sync::atomic::AtomicUsize;

    fn noop_hook() -> TerminationHook {
        Arc::new(|_, _| {})
    }

    fn server_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::stdio("alice", "srv", "mock", vec![]))
    }

    async fn connect_with(
        provider: &MockTransportProvider,
        hook: TerminationHook,
    ) -> Result<Arc<Session>, MCPOperationError> {
        let settings = BridgeConfig::default();
        let config = server_config();
        let transport = provider.create(&config, &settings).unwrap();
        Session::connect(config, &settings, transport, hook).await
    }

    #[tokio::test]
    async fn test_handshake_populates_tools() {
        let provider = MockTransportProvider::new()
            .with_server("srv", MockToolServer::new().with_echo_tool("echo"));
        let session = connect_with(&provider, noop_hook()).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.has_tool("echo"));
        assert_eq!(session.tools()[0].namespaced_name, "srv__echo");
        assert_eq!(session.server_info().unwrap().name, "mock-tool-server");

        let result = session.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(result.joined_text(), "hi");

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.call_tool("echo", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_initialize_is_initialization_error() {
        let provider =
            MockTransportProvider::new().with_server("srv", MockToolServer::new().failing_initialize());
        let err = connect_with(&provider, noop_hook()).await.unwrap_err();
        assert!(matches!(err, MCPOperationError::InitializationError { .. }));
        assert_eq!(provider.disconnect_count("srv"), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_propagates() {
        let provider = MockTransportProvider::new().failing_spawn("srv");
        let err = connect_with(&provider, noop_hook()).await.unwrap_err();
        assert!(matches!(err, MCPOperationError::StdioError { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_keeps_session() {
        let provider = MockTransportProvider::new()
            .with_server("srv", MockToolServer::new().with_echo_tool("echo"));
        let session = connect_with(&provider, noop_hook()).await.unwrap();

        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        assert_eq!(err, MCPOperationError::tool_not_found("nope"));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_crash_rejects_pending_and_fires_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let hook: TerminationHook = Arc::new(move |key, _| {
            assert_eq!(key.to_string(), "alice:srv");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let provider = MockTransportProvider::new().with_server(
            "srv",
            MockToolServer::new()
                .with_tool("hang", |_| MockReply::Silent)
                .with_tool("die", |_| MockReply::Crash(Some(137))),
        );
        let session = connect_with(&provider, hook).await.unwrap();

        let hanging: Vec<_> = (0..3)
            .map(|_| {
                let s = session.clone();
                tokio::spawn(async move { s.call_tool("hang", json!({})).await })
            })
            .collect();
        // Let the hanging requests reach the server
        while session.pending_requests().await < 3 {
            tokio::task::yield_now().await;
        }

        let err = session.call_tool("die", json!({})).await.unwrap_err();
        assert_eq!(err, MCPOperationError::process_exited(Some(137)));
        for call in hanging {
            assert_eq!(
                call.await.unwrap().unwrap_err(),
                MCPOperationError::process_exited(Some(137))
            );
        }

        // The pump finishes the teardown right after rejecting
        for _ in 0..100 {
            if session.state() == SessionState::Closed {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let provider = MockTransportProvider::new();
        let mut endpoints = provider.manual("srv");
        let connecting = tokio::spawn(connect_with_owned(provider.clone()));

        let mut endpoint = endpoints.recv().await.unwrap();
        endpoint.complete_handshake(vec![]).await;
        let session = connecting.await.unwrap().unwrap();

        endpoint.send_request(MCPRequest::new(json!("srv-1"), "ping", None));
        endpoint.send_request(MCPRequest::new(json!("srv-2"), "sampling/createMessage", None));

        let mut replies = Vec::new();
        while replies.len() < 2 {
            if let Some(MCPMessage::Response(r)) = endpoint.next_message().await {
                replies.push(r);
            }
        }
        assert_eq!(replies[0].id, json!("srv-1"));
        assert!(matches!(replies[0].payload, MCPResponsePayload::Success { .. }));
        match &replies[1].payload {
            MCPResponsePayload::Error { error } => assert_eq!(error.code, MCPError::METHOD_NOT_FOUND),
            other => panic!("expected error, got {:?}", other),
        }
        session.close().await;
    }

    async fn connect_with_owned(
        provider: MockTransportProvider,
    ) -> Result<Arc<Session>, MCPOperationError> {
        connect_with(&provider, noop_hook()).await
    }

    #[tokio::test]
    async fn test_missing_tools_capability_yields_empty_list() {
        let provider = MockTransportProvider::new();
        let mut endpoints = provider.manual("srv");
        let connecting = tokio::spawn(connect_with_owned(provider.clone()));

        let mut endpoint = endpoints.recv().await.unwrap();
        let init = endpoint.next_request().await.unwrap();
        endpoint.reply(init.id, json!({"protocolVersion": "2024-11-05", "capabilities": {}}));
        let list = endpoint.next_request().await.unwrap();
        assert_eq!(list.method, "tools/list");
        endpoint.reply_error(list.id, MCPError::METHOD_NOT_FOUND, "no tools here");

        let session = connecting.await.unwrap().unwrap();
        assert!(session.is_ready());
        assert_eq!(session.tool_count(), 0);
    }
}

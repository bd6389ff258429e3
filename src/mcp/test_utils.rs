//! Test utilities: in-process tool servers
//!
//! [`MockTransportProvider`] stands in for real processes. Each server name is
//! bound to either a scripted [`MockToolServer`] that answers the handshake and
//! tool calls on its own, or a manual mode that hands every new connection to
//! the test as a [`ServerEndpoint`] so it can withhold, reorder or crash
//! replies at will.

use crate::config::{BridgeConfig, ServerConfig};
use crate::mcp::error::MCPOperationError;
use crate::mcp::transport::{
    create_test_streams, MCPTransport, TransportInfo, TransportProvider, TransportStreams,
};
use crate::mcp::types::{
    CallToolResult, Content, MCPError, MCPMessage, MCPRequest, MCPResponse, RequestId, Tool,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type ServerMessages = mpsc::UnboundedSender<Result<MCPMessage, MCPOperationError>>;

/// The server side of one mock connection
pub struct ServerEndpoint {
    incoming: mpsc::UnboundedReceiver<MCPMessage>,
    outgoing: ServerMessages,
}

impl ServerEndpoint {
    /// Next message written by the bridge
    pub async fn next_message(&mut self) -> Option<MCPMessage> {
        self.incoming.recv().await
    }

    /// Next request written by the bridge, skipping everything else
    pub async fn next_request(&mut self) -> Option<MCPRequest> {
        loop {
            match self.incoming.recv().await? {
                MCPMessage::Request(request) => return Some(request),
                _ => continue,
            }
        }
    }

    pub fn reply(&self, id: RequestId, result: Value) {
        let _ = self
            .outgoing
            .send(Ok(MCPMessage::Response(MCPResponse::success(id, result))));
    }

    pub fn reply_error(&self, id: RequestId, code: i32, message: &str) {
        let _ = self.outgoing.send(Ok(MCPMessage::Response(MCPResponse::error(
            id,
            MCPError::new(code, message),
        ))));
    }

    /// Reply to a `tools/call` with a single text item
    pub fn reply_text(&self, id: RequestId, text: &str) {
        self.reply(id, json!({ "content": [{ "type": "text", "text": text }] }));
    }

    /// Send a request as if the server initiated it
    pub fn send_request(&self, request: MCPRequest) {
        let _ = self.outgoing.send(Ok(MCPMessage::Request(request)));
    }

    /// Push raw stream items, including errors
    pub fn push(&self, item: Result<MCPMessage, MCPOperationError>) {
        let _ = self.outgoing.send(item);
    }

    /// Simulate the process dying with an exit code
    pub fn crash(self, code: Option<i32>) {
        let _ = self.outgoing.send(Err(MCPOperationError::process_exited(code)));
    }

    /// Answer `initialize` and `tools/list` with the given tools
    pub async fn complete_handshake(&mut self, tools: Vec<Tool>) {
        if let Some(init) = self.next_request().await {
            self.reply(init.id, initialize_result());
        }
        if let Some(list) = self.next_request().await {
            self.reply(list.id, json!({ "tools": tools }));
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "mock-tool-server", "version": "0.0.0" }
    })
}

/// How a scripted tool answers one call
#[derive(Debug, Clone)]
pub enum MockReply {
    Result(CallToolResult),
    Error(i32, String),
    /// Never reply
    Silent,
    /// Reply after a delay, without blocking other calls
    Delayed(Duration, CallToolResult),
    /// Kill the connection with this exit code
    Crash(Option<i32>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Result(CallToolResult::text(text))
    }
}

pub type ToolHandler = Arc<dyn Fn(&Value) -> MockReply + Send + Sync>;

/// Scripted tool server
#[derive(Clone, Default)]
pub struct MockToolServer {
    tools: Vec<Tool>,
    handlers: HashMap<String, ToolHandler>,
    fail_initialize: bool,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> MockReply + Send + Sync + 'static,
    {
        self.tools.push(Tool {
            name: name.to_string(),
            description: format!("Mock tool {}", name),
            input_schema: json!({ "type": "object" }),
        });
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Tool returning its `text` argument
    pub fn with_echo_tool(self, name: &str) -> Self {
        self.with_tool(name, |args| {
            MockReply::text(args.get("text").and_then(Value::as_str).unwrap_or_default())
        })
    }

    /// Tool returning a text item and an image item
    pub fn with_screenshot_tool(self, name: &str) -> Self {
        self.with_tool(name, |_| {
            MockReply::Result(CallToolResult {
                content: vec![
                    Content::text("captured"),
                    Content::image("iVBORw0KGgo=", "image/png"),
                ],
                is_error: None,
            })
        })
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Every `tools/call` received so far, as (name, arguments)
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn serve(self, mut endpoint: ServerEndpoint) {
        while let Some(message) = endpoint.next_message().await {
            let MCPMessage::Request(request) = message else {
                continue;
            };
            match request.method.as_str() {
                "initialize" if self.fail_initialize => {
                    endpoint.reply_error(request.id, MCPError::INTERNAL_ERROR, "initialize refused")
                }
                "initialize" => endpoint.reply(request.id, initialize_result()),
                "tools/list" => endpoint.reply(request.id, json!({ "tools": self.tools })),
                "tools/call" => {
                    let params = request.params.unwrap_or(Value::Null);
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                    self.calls
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((name.clone(), arguments.clone()));

                    let Some(handler) = self.handlers.get(&name) else {
                        endpoint.reply_error(request.id, -32602, &format!("Unknown tool: {}", name));
                        continue;
                    };
                    match handler(&arguments) {
                        MockReply::Result(result) => endpoint.reply(request.id, json!(result)),
                        MockReply::Error(code, message) => {
                            endpoint.reply_error(request.id, code, &message)
                        }
                        MockReply::Silent => {}
                        MockReply::Delayed(delay, result) => {
                            let outgoing = endpoint.outgoing.clone();
                            let id = request.id;
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let reply = MCPResponse::success(id, json!(result));
                                let _ = outgoing.send(Ok(MCPMessage::Response(reply)));
                            });
                        }
                        MockReply::Crash(code) => {
                            endpoint.crash(code);
                            return;
                        }
                    }
                }
                _ => endpoint.reply_error(
                    request.id,
                    MCPError::METHOD_NOT_FOUND,
                    &format!("Method not found: {}", request.method),
                ),
            }
        }
    }
}

#[derive(Default)]
struct ProviderState {
    scripted: HashMap<String, MockToolServer>,
    manual: HashMap<String, mpsc::UnboundedSender<ServerEndpoint>>,
    failing: HashSet<String>,
    connects: HashMap<String, usize>,
    disconnects: HashMap<String, usize>,
}

/// Transport provider serving mock servers by server name
#[derive(Clone, Default)]
pub struct MockTransportProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockTransportProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_server(self, server_name: &str, server: MockToolServer) -> Self {
        self.state().scripted.insert(server_name.to_string(), server);
        self
    }

    /// Make every spawn of this server fail
    pub fn failing_spawn(self, server_name: &str) -> Self {
        self.state().failing.insert(server_name.to_string());
        self
    }

    /// Receive each new connection to this server as a manual endpoint
    pub fn manual(&self, server_name: &str) -> mpsc::UnboundedReceiver<ServerEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().manual.insert(server_name.to_string(), tx);
        rx
    }

    /// How many times a transport for this server was connected
    pub fn connect_count(&self, server_name: &str) -> usize {
        self.state().connects.get(server_name).copied().unwrap_or(0)
    }

    pub fn disconnect_count(&self, server_name: &str) -> usize {
        self.state().disconnects.get(server_name).copied().unwrap_or(0)
    }
}

impl TransportProvider for MockTransportProvider {
    fn create(
        &self,
        server: &ServerConfig,
        _settings: &BridgeConfig,
    ) -> Result<Box<dyn MCPTransport>, MCPOperationError> {
        Ok(Box::new(MockTransport {
            server_name: server.server_name.clone(),
            provider: self.clone(),
            connected: false,
            server_task: None,
        }))
    }
}

struct MockTransport {
    server_name: String,
    provider: MockTransportProvider,
    connected: bool,
    server_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl MCPTransport for MockTransport {
    async fn connect(&mut self) -> Result<TransportStreams, MCPOperationError> {
        let (read_tx, write_rx, streams) = create_test_streams();
        let endpoint = ServerEndpoint {
            incoming: write_rx,
            outgoing: read_tx,
        };

        let mut state = self.provider.state();
        *state.connects.entry(self.server_name.clone()).or_default() += 1;

        if state.failing.contains(&self.server_name) {
            return Err(MCPOperationError::stdio(format!(
                "Failed to spawn process '{}': No such file or directory",
                self.server_name
            )));
        }
        if let Some(manual) = state.manual.get(&self.server_name) {
            manual
                .send(endpoint)
                .map_err(|_| MCPOperationError::stdio("Manual endpoint receiver dropped"))?;
        } else if let Some(server) = state.scripted.get(&self.server_name) {
            self.server_task = Some(tokio::spawn(server.clone().serve(endpoint)));
        } else {
            return Err(MCPOperationError::stdio(format!(
                "Failed to spawn process '{}': no mock server registered",
                self.server_name
            )));
        }

        self.connected = true;
        Ok(streams)
    }

    async fn disconnect(&mut self) -> Result<(), MCPOperationError> {
        if let Some(task) = self.server_task.take() {
            task.abort();
        }
        if self.connected {
            self.connected = false;
            *self
                .provider
                .state()
                .disconnects
                .entry(self.server_name.clone())
                .or_default() += 1;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "mock".to_string(),
            endpoint: self.server_name.clone(),
        }
    }
}

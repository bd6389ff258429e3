//! Network transport: one HTTP POST per message
//!
//! There is no persistent connection to lose, so this transport never reports
//! termination. A failed round-trip (connection refused, non-2xx status,
//! unreadable body) is turned into a JSON-RPC error reply for the request that
//! caused it, which rejects that one call and leaves the Session alone.

use super::{channel_sink, MCPTransport, TransportInfo, TransportStreams};
use crate::mcp::codec::{decode_body, encode_body};
use crate::mcp::error::MCPOperationError;
use crate::mcp::types::{MCPError, MCPMessage, MCPResponse};
use crate::utils::logging::{obscure_credential, truncate_string};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use url::Url;

/// Header carrying the server-assigned session id
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Configuration for network tool servers
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint URL
    pub url: String,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
    /// Upper bound on a single round-trip
    pub request_timeout: Duration,
    /// Session identity used in log lines
    pub label: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            label: "http".to_string(),
        }
    }
}

struct HttpEndpoint {
    client: reqwest::Client,
    url: Url,
    headers: HashMap<String, String>,
    session_id: Mutex<Option<String>>,
    label: String,
}

impl HttpEndpoint {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_HEADER, id);
        }
        request
    }

    async fn post(&self, message: &MCPMessage) -> Result<Vec<MCPMessage>, MCPOperationError> {
        let body = encode_body(message)?;
        let request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);

        let response = self
            .apply_headers(request)
            .send()
            .await
            .map_err(|e| MCPOperationError::http(format!("Request to {} failed: {}", self.url, e)))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_deref() != Some(id) {
                debug!(session = %self.label, "Server assigned a session id");
                *slot = Some(id.to_string());
            }
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| MCPOperationError::http(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(MCPOperationError::http(format!(
                "HTTP {}: {}",
                status,
                truncate_string(text.trim(), MAX_ERROR_BODY_CHARS)
            )));
        }

        Ok(decode_body(content_type.as_deref(), &text))
    }

    async fn end_session(&self) {
        let Some(id) = self.session_id() else {
            return;
        };
        let mut request = self.client.delete(self.url.clone());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match request.header(SESSION_HEADER, id).send().await {
            Ok(response) => debug!(session = %self.label, status = %response.status(), "Ended remote session"),
            Err(e) => debug!(session = %self.label, error = %e, "Failed to end remote session"),
        }
    }
}

async fn deliver(
    endpoint: Arc<HttpEndpoint>,
    message: MCPMessage,
    read_tx: mpsc::UnboundedSender<Result<MCPMessage, MCPOperationError>>,
) {
    match endpoint.post(&message).await {
        Ok(replies) => {
            for reply in replies {
                if read_tx.send(Ok(reply)).is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            warn!(session = %endpoint.label, error = %e, "HTTP round-trip failed");
            if let MCPMessage::Request(request) = message {
                let reply = MCPResponse::error(request.id, MCPError::transport_failure(e.to_string()));
                let _ = read_tx.send(Ok(MCPMessage::Response(reply)));
            }
        }
    }
}

/// HTTP transport implementation
pub struct HttpTransport {
    endpoint: Arc<HttpEndpoint>,
    connected: bool,
    started: bool,
    dispatcher: Option<JoinHandle<()>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, MCPOperationError> {
        let url = Url::parse(&config.url)
            .map_err(|e| MCPOperationError::http(format!("Invalid URL '{}': {}", config.url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(MCPOperationError::http(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MCPOperationError::http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: Arc::new(HttpEndpoint {
                client,
                url,
                headers: config.headers,
                session_id: Mutex::new(None),
                label: config.label,
            }),
            connected: false,
            started: false,
            dispatcher: None,
        })
    }
}

#[async_trait]
impl MCPTransport for HttpTransport {
    async fn connect(&mut self) -> Result<TransportStreams, MCPOperationError> {
        if self.started {
            return Err(MCPOperationError::transport(
                "HTTP transport cannot be reconnected; create a new one",
            ));
        }
        self.started = true;
        debug!(
            session = %self.endpoint.label,
            url = %self.endpoint.url,
            headers = ?self
                .endpoint
                .headers
                .iter()
                .map(|(name, value)| format!("{}: {}", name, obscure_credential(value)))
                .collect::<Vec<_>>(),
            "Connecting to HTTP tool server"
        );

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<MCPMessage>();

        let endpoint = Arc::clone(&self.endpoint);
        self.dispatcher = Some(tokio::spawn(async move {
            // Each message is its own round-trip; replies may overtake each other.
            // Dropping the set aborts every delivery still in flight.
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    message = write_rx.recv() => match message {
                        Some(message) => {
                            in_flight.spawn(deliver(Arc::clone(&endpoint), message, read_tx.clone()));
                        }
                        None => break,
                    },
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
        }));
        self.connected = true;

        Ok(TransportStreams {
            read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(read_rx)),
            write_stream: channel_sink(write_tx),
        })
    }

    async fn disconnect(&mut self) -> Result<(), MCPOperationError> {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            // Wait for the abort so no delivery outlives the transport
            let _ = dispatcher.await;
            self.endpoint.end_session().await;
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "http".to_string(),
            endpoint: self.endpoint.url.to_string(),
        }
    }
}

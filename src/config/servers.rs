//! Tool server definitions and the store that serves them
//!
//! A [`ServerConfig`] is immutable once a Session has been built from it; to
//! change a live server, update the record and the bridge reconnects on the
//! next call.

use super::ConfigError;
use crate::bridge::discovery::sanitize_server_name;
use crate::bridge::session::SessionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use url::Url;

/// How the bridge reaches a tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process over stdin/stdout
    #[default]
    Stdio,
    /// One HTTP POST per message
    Http,
}

/// Extra capture call issued after every action while recording is on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Raw name of the server tool that captures a frame
    pub capture_tool: String,
    #[serde(default = "empty_arguments")]
    pub capture_arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Default::default())
}

/// One external tool server an owner wants to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub owner_id: String,
    pub server_name: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Per-server override of the bridge request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingConfig>,
}

impl ServerConfig {
    /// A process-transport server
    pub fn stdio(
        owner_id: impl Into<String>,
        server_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::bare(owner_id.into(), server_name.into(), TransportKind::Stdio)
        }
    }

    /// A network-transport server
    pub fn http(
        owner_id: impl Into<String>,
        server_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::bare(owner_id.into(), server_name.into(), TransportKind::Http)
        }
    }

    fn bare(owner_id: String, server_name: String, transport: TransportKind) -> Self {
        Self {
            owner_id,
            server_name,
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            request_timeout_ms: None,
            recording: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_recording(mut self, capture_tool: impl Into<String>, capture_arguments: Value) -> Self {
        self.recording = Some(RecordingConfig {
            capture_tool: capture_tool.into(),
            capture_arguments,
        });
        self
    }

    /// Registry key of the Session built from this definition
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.owner_id, &self.server_name)
    }

    /// Identifier-safe form of the server name used as the tool prefix
    pub fn namespace(&self) -> String {
        sanitize_server_name(&self.server_name)
    }

    /// Effective request timeout for calls on this server
    pub fn request_timeout(&self, default: Duration) -> Duration {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_id.trim().is_empty() {
            return Err(ConfigError::Validation("Owner id cannot be empty".to_string()));
        }
        if self.namespace().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Server name '{}' has no identifier characters",
                self.server_name
            )));
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::Validation(format!(
                        "Server '{}' uses stdio transport but has no command",
                        self.server_name
                    )));
                }
            }
            TransportKind::Http => {
                let raw = self.url.as_deref().ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "Server '{}' uses http transport but has no url",
                        self.server_name
                    ))
                })?;
                let url = Url::parse(raw).map_err(|e| {
                    ConfigError::Validation(format!("Invalid url '{}': {}", raw, e))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::Validation(format!(
                        "Unsupported url scheme '{}'",
                        url.scheme()
                    )));
                }
            }
        }

        if let Some(recording) = &self.recording {
            if recording.capture_tool.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Recording capture tool cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Source of server definitions, owned by the caller
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Every server configured for an owner
    async fn servers(&self, owner_id: &str) -> Result<Vec<ServerConfig>, ConfigError>;

    async fn get(
        &self,
        owner_id: &str,
        server_name: &str,
    ) -> Result<Option<ServerConfig>, ConfigError>;

    /// Insert or replace a definition
    async fn put(&self, config: ServerConfig) -> Result<(), ConfigError>;

    async fn remove(
        &self,
        owner_id: &str,
        server_name: &str,
    ) -> Result<Option<ServerConfig>, ConfigError>;
}

/// Process-local store, also used by the operator binary and tests
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    servers: RwLock<BTreeMap<(String, String), ServerConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servers(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        let store = Self::new();
        {
            let mut map = store.servers.write().unwrap_or_else(PoisonError::into_inner);
            for server in servers {
                map.insert((server.owner_id.clone(), server.server_name.clone()), server);
            }
        }
        store
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn servers(&self, owner_id: &str) -> Result<Vec<ServerConfig>, ConfigError> {
        let map = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .iter()
            .filter(|((owner, _), _)| owner == owner_id)
            .map(|(_, config)| config.clone())
            .collect())
    }

    async fn get(
        &self,
        owner_id: &str,
        server_name: &str,
    ) -> Result<Option<ServerConfig>, ConfigError> {
        let map = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(&(owner_id.to_string(), server_name.to_string()))
            .cloned())
    }

    async fn put(&self, config: ServerConfig) -> Result<(), ConfigError> {
        let mut map = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        map.insert((config.owner_id.clone(), config.server_name.clone()), config);
        Ok(())
    }

    async fn remove(
        &self,
        owner_id: &str,
        server_name: &str,
    ) -> Result<Option<ServerConfig>, ConfigError> {
        let mut map = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        Ok(map.remove(&(owner_id.to_string(), server_name.to_string())))
    }
}

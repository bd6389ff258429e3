//! Configuration management
//!
//! Bridge-wide settings (timeouts, client identity, recording limits) live in
//! [`BridgeConfig`]. Per-owner tool server definitions live in
//! [`ServerConfig`] records served by a [`ConfigStore`]. Both can be loaded
//! from a TOML, YAML or JSON file through [`ConfigFile`], and bridge settings
//! can be overridden from `TOOLBRIDGE_*` environment variables.

mod servers;

pub use servers::{
    ConfigStore, InMemoryConfigStore, RecordingConfig, ServerConfig, TransportKind,
};

use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use thiserror::Error;

/// Protocol revision sent in the `initialize` request by default
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bridge-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Deadline for a single request (tools/call, tools/list)
    #[serde(
        rename = "request_timeout_ms",
        with = "duration_millis",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    /// Deadline for spawn + initialize + discovery
    #[serde(
        rename = "handshake_timeout_ms",
        with = "duration_millis",
        default = "default_handshake_timeout"
    )]
    pub handshake_timeout: Duration,
    /// Inactivity window after which a Session is closed
    #[serde(
        rename = "idle_timeout_ms",
        with = "duration_millis",
        default = "default_idle_timeout"
    )]
    pub idle_timeout: Duration,
    /// Time a stopping process gets before it is killed
    #[serde(
        rename = "shutdown_grace_ms",
        with = "duration_millis",
        default = "default_shutdown_grace"
    )]
    pub shutdown_grace: Duration,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Most recording frames kept per Session
    #[serde(default = "default_max_recorded_frames")]
    pub max_recorded_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: default_idle_timeout(),
            shutdown_grace: default_shutdown_grace(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            protocol_version: default_protocol_version(),
            max_recorded_frames: default_max_recorded_frames(),
        }
    }
}

const ENV_REQUEST_TIMEOUT: &str = "TOOLBRIDGE_REQUEST_TIMEOUT_MS";
const ENV_HANDSHAKE_TIMEOUT: &str = "TOOLBRIDGE_HANDSHAKE_TIMEOUT_MS";
const ENV_IDLE_TIMEOUT: &str = "TOOLBRIDGE_IDLE_TIMEOUT_MS";
const ENV_SHUTDOWN_GRACE: &str = "TOOLBRIDGE_SHUTDOWN_GRACE_MS";
const ENV_CLIENT_NAME: &str = "TOOLBRIDGE_CLIENT_NAME";
const ENV_PROTOCOL_VERSION: &str = "TOOLBRIDGE_PROTOCOL_VERSION";
const ENV_MAX_RECORDED_FRAMES: &str = "TOOLBRIDGE_MAX_RECORDED_FRAMES";

fn lookup_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::EnvVarParse(format!("{}: {}", name, e))),
        None => Ok(None),
    }
}

impl BridgeConfig {
    /// Load settings from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_with_env()
    }

    /// Apply environment overrides; the environment takes precedence
    pub fn merge_with_env(self) -> Result<Self, ConfigError> {
        self.merge_with_lookup(|name| env::var(name).ok())
    }

    /// Apply `TOOLBRIDGE_*` overrides read through `lookup` instead of the
    /// process environment
    pub fn merge_with_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(timeout) = lookup_millis(&lookup, ENV_REQUEST_TIMEOUT)? {
            self.request_timeout = timeout;
        }
        if let Some(timeout) = lookup_millis(&lookup, ENV_HANDSHAKE_TIMEOUT)? {
            self.handshake_timeout = timeout;
        }
        if let Some(timeout) = lookup_millis(&lookup, ENV_IDLE_TIMEOUT)? {
            self.idle_timeout = timeout;
        }
        if let Some(grace) = lookup_millis(&lookup, ENV_SHUTDOWN_GRACE)? {
            self.shutdown_grace = grace;
        }
        if let Some(name) = lookup(ENV_CLIENT_NAME) {
            self.client_name = name;
        }
        if let Some(version) = lookup(ENV_PROTOCOL_VERSION) {
            self.protocol_version = version;
        }
        if let Some(frames) = lookup(ENV_MAX_RECORDED_FRAMES) {
            self.max_recorded_frames = frames.trim().parse().map_err(|e| {
                ConfigError::EnvVarParse(format!("{}: {}", ENV_MAX_RECORDED_FRAMES, e))
            })?;
        }
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("idle_timeout", self.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Client name cannot be empty".to_string(),
            ));
        }
        if self.protocol_version.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Protocol version cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// On-disk layout: bridge settings plus a list of server definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl ConfigFile {
    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str());

        let file: Self = match extension {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))?
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))?
            }
            _ => {
                return Err(ConfigError::FileParse(
                    "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
                ))
            }
        };

        file.bridge.validate()?;
        for server in &file.servers {
            server.validate()?;
        }
        Ok(file)
    }
}

/// Custom serialization for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Default value functions for serde
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_client_name() -> String {
    "toolbridge".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_max_recorded_frames() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.protocol_version, "2024-11-05");
        assert_eq!(config.max_recorded_frames, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BridgeConfig::default();
        config.idle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.client_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_config_loading() {
        let toml_content = r#"
[bridge]
request_timeout_ms = 1500
idle_timeout_ms = 60000

[[servers]]
owner_id = "alice"
server_name = "files"
transport = "stdio"
command = "node"
args = ["files-server.js"]
env = { ROOT = "/srv" }

[[servers]]
owner_id = "alice"
server_name = "search"
transport = "http"
url = "https://search.example.com/mcp"
headers = { Authorization = "Bearer t" }
request_timeout_ms = 5000
"#;

        let temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();

        let file = ConfigFile::from_path(temp_file.path()).unwrap();
        assert_eq!(file.bridge.request_timeout, Duration::from_millis(1500));
        assert_eq!(file.bridge.idle_timeout, Duration::from_secs(60));
        assert_eq!(file.bridge.handshake_timeout, Duration::from_secs(30));
        assert_eq!(file.servers.len(), 2);
        assert_eq!(file.servers[0].transport, TransportKind::Stdio);
        assert_eq!(file.servers[0].env.get("ROOT").map(String::as_str), Some("/srv"));
        assert_eq!(file.servers[1].transport, TransportKind::Http);
        assert_eq!(
            file.servers[1].request_timeout(file.bridge.request_timeout),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_yaml_and_json_loading() {
        let yaml = "servers:\n  - owner_id: bob\n    server_name: git\n    command: git-tools\n";
        let temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        std::fs::write(temp_file.path(), yaml).unwrap();
        let file = ConfigFile::from_path(temp_file.path()).unwrap();
        assert_eq!(file.servers[0].command.as_deref(), Some("git-tools"));
        assert_eq!(file.bridge, BridgeConfig::default());

        let json = r#"{"servers": [{"owner_id": "bob", "server_name": "web", "transport": "http", "url": "http://localhost:9000/mcp"}]}"#;
        let temp_file = NamedTempFile::with_suffix(".json").unwrap();
        std::fs::write(temp_file.path(), json).unwrap();
        let file = ConfigFile::from_path(temp_file.path()).unwrap();
        assert_eq!(file.servers[0].transport, TransportKind::Http);
    }

    #[test]
    fn test_invalid_server_in_file_is_rejected() {
        let toml_content = r#"
[[servers]]
owner_id = "alice"
server_name = "broken"
transport = "http"
"#;
        let temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();
        assert!(matches!(
            ConfigFile::from_path(temp_file.path()),
            Err(ConfigError::Validation(_))
        ));

        let temp_file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(matches!(
            ConfigFile::from_path(temp_file.path()),
            Err(ConfigError::FileParse(_))
        ));
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_var_loading() {
        let overrides = vars(&[
            (ENV_IDLE_TIMEOUT, "1000"),
            (ENV_CLIENT_NAME, "agent-runtime"),
            (ENV_MAX_RECORDED_FRAMES, " 12 "),
        ]);

        let config = BridgeConfig::default()
            .merge_with_lookup(|name| overrides.get(name).cloned())
            .unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.client_name, "agent-runtime");
        assert_eq!(config.max_recorded_frames, 12);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_var_parse_errors() {
        let overrides = vars(&[(ENV_REQUEST_TIMEOUT, "soon")]);
        assert!(matches!(
            BridgeConfig::default().merge_with_lookup(|name| overrides.get(name).cloned()),
            Err(ConfigError::EnvVarParse(msg)) if msg.contains(ENV_REQUEST_TIMEOUT)
        ));

        let overrides = vars(&[(ENV_MAX_RECORDED_FRAMES, "many")]);
        assert!(matches!(
            BridgeConfig::default().merge_with_lookup(|name| overrides.get(name).cloned()),
            Err(ConfigError::EnvVarParse(_))
        ));
    }
}

//! Configuration management for the negotiator
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! Later sources win: file, then `MCP_NEGOTIATOR_*` variables, then CLI
//! flags.

use crate::error::{NegotiatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Race and transport settings
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    /// OAuth client settings
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Optional relay for targets unreachable directly
    #[serde(default)]
    pub relay: RelayConfig,
    /// Where shared state lives
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Race and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Deadline for the race phase, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// How long hinted candidates race alone, in milliseconds
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Pause after disconnecting before a new attempt starts, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Upper bound on closing one losing handle, in milliseconds
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Path segment of the streaming transport
    #[serde(default = "default_streaming_path")]
    pub streaming_path: String,

    /// Path segment of the legacy transport
    #[serde(default = "default_legacy_path")]
    pub legacy_path: String,

    /// Protocol version offered during the handshake
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Origin presented in capability probes
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Client name sent in `initialize`
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_close_timeout_ms() -> u64 {
    5000
}

fn default_streaming_path() -> String {
    "mcp".to_string()
}

fn default_legacy_path() -> String {
    "sse".to_string()
}

fn default_protocol_version() -> String {
    crate::mcp::types::DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_client_name() -> String {
    "mcp-negotiator".to_string()
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            grace_period_ms: default_grace_period_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            streaming_path: default_streaming_path(),
            legacy_path: default_legacy_path(),
            protocol_version: default_protocol_version(),
            origin: default_origin(),
            client_name: default_client_name(),
        }
    }
}

impl NegotiationConfig {
    /// Race-phase deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Grace window for hinted candidates.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Pause between a disconnect and the next attempt.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Upper bound on closing one handle.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Redirect URI registered for this client
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Client name used for dynamic registration
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Pre-registered client ids keyed by hostname or `host:port`
    #[serde(default)]
    pub static_clients: HashMap<String, String>,

    /// Scope requested when discovery advertises none
    #[serde(default = "default_scope")]
    pub default_scope: String,
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/oauth/callback".to_string()
}

fn default_scope() -> String {
    "openid profile email".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_uri: default_redirect_uri(),
            client_name: default_client_name(),
            static_clients: HashMap::new(),
            default_scope: default_scope(),
        }
    }
}

/// Relay settings
///
/// The relay is used only when both a URL and a credential are present.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay base URL
    #[serde(default)]
    pub url: Option<String>,
    /// Delegated credential presented to the relay
    #[serde(default)]
    pub credential: Option<String>,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("url", &self.url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Storage backend for shared state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory only
    #[default]
    Memory,
    /// JSON files in `directory`
    File,
    /// JSON files for lists, OS keyring for secrets
    Keyring,
}

impl std::str::FromStr for StorageBackend {
    type Err = NegotiatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            "keyring" => Ok(StorageBackend::Keyring),
            other => Err(NegotiatorError::Config(format!(
                "Invalid storage backend: {}. Must be one of: memory, file, keyring",
                other
            ))),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum length of the recent-target list
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Backend kind
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory for file-backed stores
    #[serde(default = "default_storage_dir")]
    pub directory: PathBuf,
}

fn default_recent_capacity() -> usize {
    10
}

fn default_storage_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "mcp-negotiator")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mcp-negotiator"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
            backend: StorageBackend::default(),
            directory: default_storage_dir(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NegotiatorError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| NegotiatorError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(timeout) = std::env::var("MCP_NEGOTIATOR_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.negotiation.timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCP_NEGOTIATOR_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(grace) = std::env::var("MCP_NEGOTIATOR_GRACE_PERIOD_MS") {
            if let Ok(value) = grace.parse() {
                self.negotiation.grace_period_ms = value;
            } else {
                tracing::warn!("Invalid MCP_NEGOTIATOR_GRACE_PERIOD_MS: {}", grace);
            }
        }

        if let Ok(url) = std::env::var("MCP_NEGOTIATOR_RELAY_URL") {
            tracing::debug!(url = %url, "Env override: MCP_NEGOTIATOR_RELAY_URL");
            self.relay.url = Some(url);
        }

        if let Ok(token) = std::env::var("MCP_NEGOTIATOR_RELAY_TOKEN") {
            tracing::debug!("Env override: MCP_NEGOTIATOR_RELAY_TOKEN");
            self.relay.credential = Some(token);
        }

        if let Ok(redirect) = std::env::var("MCP_NEGOTIATOR_REDIRECT_URI") {
            self.oauth.redirect_uri = redirect;
        }

        if let Ok(backend) = std::env::var("MCP_NEGOTIATOR_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(value) => self.storage.backend = value,
                Err(_) => tracing::warn!("Invalid MCP_NEGOTIATOR_STORAGE_BACKEND: {}", backend),
            }
        }

        if let Ok(dir) = std::env::var("MCP_NEGOTIATOR_STORAGE_DIR") {
            self.storage.directory = PathBuf::from(dir);
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(url) = cli.relay_url_override() {
            self.relay.url = Some(url.to_string());
        }
        if let Some(token) = cli.relay_token_override() {
            self.relay.credential = Some(token.to_string());
        }
        if let Some(timeout) = cli.timeout_override() {
            self.negotiation.timeout_seconds = timeout;
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let n = &self.negotiation;

        if n.timeout_seconds == 0 {
            return Err(NegotiatorError::Config(
                "negotiation.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if n.grace_period_ms >= n.timeout_seconds.saturating_mul(1000) {
            return Err(NegotiatorError::Config(
                "negotiation.grace_period_ms must be shorter than the overall timeout".to_string(),
            )
            .into());
        }

        if n.close_timeout_ms == 0 {
            return Err(NegotiatorError::Config(
                "negotiation.close_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        for (name, segment) in [("streaming_path", &n.streaming_path), ("legacy_path", &n.legacy_path)] {
            if segment.trim_matches('/').is_empty() {
                return Err(NegotiatorError::Config(format!(
                    "negotiation.{} cannot be empty",
                    name
                ))
                .into());
            }
        }

        if n.streaming_path.trim_matches('/') == n.legacy_path.trim_matches('/') {
            return Err(NegotiatorError::Config(
                "negotiation.streaming_path and negotiation.legacy_path must differ".to_string(),
            )
            .into());
        }

        if self.storage.recent_capacity == 0 {
            return Err(NegotiatorError::Config(
                "storage.recent_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if let Some(relay) = &self.relay.url {
            let parsed = url::Url::parse(relay).map_err(|e| {
                NegotiatorError::Config(format!("relay.url is not a valid URL: {}", e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(NegotiatorError::Config(format!(
                    "relay.url must use http or https, got {}",
                    parsed.scheme()
                ))
                .into());
            }
        }

        url::Url::parse(&self.oauth.redirect_uri).map_err(|e| {
            NegotiatorError::Config(format!("oauth.redirect_uri is not a valid URL: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.negotiation.timeout_seconds, 30);
        assert_eq!(config.negotiation.grace_period_ms, 3000);
        assert_eq!(config.negotiation.streaming_path, "mcp");
        assert_eq!(config.negotiation.legacy_path, "sse");
        assert_eq!(config.storage.recent_capacity, 10);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.relay.url.is_none());
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.negotiation.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_grace_not_shorter_than_timeout() {
        let mut config = Config::default();
        config.negotiation.timeout_seconds = 2;
        config.negotiation.grace_period_ms = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_path_segment() {
        let mut config = Config::default();
        config.negotiation.legacy_path = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_recent_capacity() {
        let mut config = Config::default();
        config.storage.recent_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_non_http_relay() {
        let mut config = Config::default();
        config.relay.url = Some("ftp://relay.example.com".to_string());
        assert!(config.validate().is_err());

        config.relay.url = Some("https://relay.example.com/proxy".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
negotiation:
  timeout_seconds: 45
  grace_period_ms: 1500
oauth:
  static_clients:
    api.example.com: client-123
relay:
  url: https://relay.example.com/proxy
  credential: secret
storage:
  backend: file
  directory: /tmp/negotiator
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.negotiation.timeout_seconds, 45);
        assert_eq!(config.negotiation.grace_period_ms, 1500);
        assert_eq!(config.negotiation.settle_delay_ms, 500);
        assert_eq!(
            config.oauth.static_clients.get("api.example.com").map(String::as_str),
            Some("client-123")
        );
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.validate().is_ok());
        assert!(!format!("{:?}", config.relay).contains("secret"));
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        let cli = crate::cli::Cli::default();
        let config = Config::load("/nonexistent/negotiator.yaml", &cli).unwrap();
        assert_eq!(config.negotiation.streaming_path, "mcp");
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        std::env::set_var("MCP_NEGOTIATOR_TIMEOUT_SECONDS", "12");
        std::env::set_var("MCP_NEGOTIATOR_STORAGE_BACKEND", "keyring");
        std::env::set_var("MCP_NEGOTIATOR_GRACE_PERIOD_MS", "not-a-number");

        let mut config = Config::default();
        config.apply_env_vars();

        std::env::remove_var("MCP_NEGOTIATOR_TIMEOUT_SECONDS");
        std::env::remove_var("MCP_NEGOTIATOR_STORAGE_BACKEND");
        std::env::remove_var("MCP_NEGOTIATOR_GRACE_PERIOD_MS");

        assert_eq!(config.negotiation.timeout_seconds, 12);
        assert_eq!(config.storage.backend, StorageBackend::Keyring);
        assert_eq!(config.negotiation.grace_period_ms, 3000);
    }

    #[test]
    fn test_cli_overrides_win() {
        use clap::Parser;
        let cli = crate::cli::Cli::try_parse_from([
            "mcp-negotiator",
            "connect",
            "example.com",
            "--relay-url",
            "https://relay.example.com",
            "--timeout",
            "9",
        ])
        .unwrap();
        let mut config = Config::default();
        config.apply_cli_overrides(&cli);
        assert_eq!(config.relay.url.as_deref(), Some("https://relay.example.com"));
        assert_eq!(config.negotiation.timeout_seconds, 9);
    }

    #[test]
    fn test_shipped_example_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/negotiator.yaml");
        let config = Config::from_file(path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.relay.url.is_none());
    }
}

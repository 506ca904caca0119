//! Client configuration
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty file (or [`ClientConfig::default`]) yields a usable client that talks
//! to a local broker and retries forever.

use crate::lifecycle::policy::{MaxReconnectAttempts, ReconnectPolicy};
use crate::transport::SessionIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Cluster identifier presented on every (re)connect
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// Client identifier; generated once per process when absent
    #[serde(default)]
    pub client_id: Option<String>,
    /// Fixed delay before each reconnect attempt, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts allowed after a disconnect (negative or absent = unbounded)
    #[serde(default)]
    pub max_reconnect_attempts: MaxReconnectAttempts,
    #[serde(default)]
    pub transport: TransportSection,
}

/// Transport section - passed through to the transport on every open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Broker URL with protocol and port
    #[serde(default = "default_url")]
    pub url: String,
    /// Keep-alive probe interval in milliseconds
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Missed probes tolerated before the transport reports the session lost
    #[serde(default = "default_max_ping_out")]
    pub max_ping_out: u32,
    /// Upper bound on waiting for the first acknowledgment, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Environment variable containing username
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_cluster_id() -> String {
    "local-cluster".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_max_ping_out() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            ping_interval_ms: default_ping_interval_ms(),
            max_ping_out: default_max_ping_out(),
            connect_timeout_ms: default_connect_timeout_ms(),
            username_env: None,
            password_env: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            client_id: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: MaxReconnectAttempts::Unbounded,
            transport: TransportSection::default(),
        }
    }
}

impl TransportSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Resolve credentials from the configured environment variables
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("cluster_id", &self.cluster_id)?;
        if let Some(client_id) = &self.client_id {
            validate_identifier("client_id", client_id)?;
        }
        if self.transport.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.ping_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Fix the session identity for this process, generating a client id if needed
    pub fn session_identity(&self) -> SessionIdentity {
        SessionIdentity {
            cluster_id: self.cluster_id.clone(),
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(generate_client_id),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

/// Generate a unique client identifier: `client-<uuid>`
pub fn generate_client_id() -> String {
    format!("client-{}", Uuid::new_v4().simple())
}

/// Identifiers must match [a-zA-Z0-9._-]+
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if value.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} '{value}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

//! Configuration system for mfs
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/mfs/config.toml
//! - Linux: ~/.config/mfs/config.toml
//! - Windows: %APPDATA%/mfs/config.toml
//!
//! Command-line flags override values read from the file.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_BUS_PORT, DEFAULT_SYNC_INTERVAL_MS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local node identity and replicated root
    pub node: NodeConfig,
    /// Flush, echo suppression and join settings
    pub sync: SyncConfig,
    /// Bus client settings
    pub bus: BusConfig,
    /// Bus server settings
    pub server: ServerConfig,
}

/// Role a node plays in the join handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    /// Serve snapshots to joining hosts
    #[default]
    Responder,
    /// Pull a snapshot from peers at startup
    Requester,
    /// Take no part in the join handshake
    Disabled,
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncRole::Responder => "responder",
            SyncRole::Requester => "requester",
            SyncRole::Disabled => "disabled",
        })
    }
}

impl FromStr for SyncRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "responder" => Ok(SyncRole::Responder),
            "requester" => Ok(SyncRole::Requester),
            "disabled" | "none" => Ok(SyncRole::Disabled),
            other => Err(ConfigError::Invalid(format!("unknown sync role: {}", other))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory tree to watch and replicate
    pub root: PathBuf,
    /// Host identity on the bus (defaults to the OS hostname)
    pub host_id: Option<String>,
    /// Join handshake role
    pub role: SyncRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/data"),
            host_id: None,
            role: SyncRole::default(),
        }
    }
}

/// Replication timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Flush interval in milliseconds
    pub interval_ms: u64,
    /// Echo lock TTL in milliseconds (defaults to the flush interval)
    pub echo_ttl_ms: Option<u64>,
    /// Give up waiting for a join snapshot after this many seconds (None = wait forever)
    pub join_timeout_secs: Option<u64>,
    /// Attempts per inbound mutation (1 = no retry)
    pub apply_attempts: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            echo_ttl_ms: None,
            join_timeout_secs: None,
            apply_attempts: 1,
            retry_backoff_ms: 100,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Echo lock TTL, never shorter than the flush interval unless set explicitly
    pub fn echo_ttl(&self) -> Duration {
        self.echo_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.interval())
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_secs.map(Duration::from_secs)
    }
}

/// Bus client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Authentication token
    pub token: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![format!("ws://localhost:{}", DEFAULT_BUS_PORT)],
            token: "token".into(),
            connect_timeout_secs: 10,
        }
    }
}

impl BusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Bus server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Token clients must present (None = accept any)
    pub token: Option<String>,
    /// Maximum subscribers per channel
    pub max_subscribers_per_channel: usize,
    /// Idle timeout for empty channels in seconds
    pub channel_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_BUS_PORT,
            token: None,
            max_subscribers_per_channel: 1024,
            channel_idle_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "mfs", "mfs").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.root, PathBuf::from("/data"));
        assert_eq!(config.node.role, SyncRole::Responder);
        assert_eq!(config.sync.interval(), Duration::from_secs(2));
        assert_eq!(config.server.port, 4443);
        assert_eq!(config.bus.endpoints, vec!["ws://localhost:4443".to_string()]);
    }

    #[test]
    fn test_echo_ttl_defaults_to_interval() {
        let mut sync = SyncConfig {
            interval_ms: 500,
            ..SyncConfig::default()
        };
        assert_eq!(sync.echo_ttl(), Duration::from_millis(500));

        sync.echo_ttl_ms = Some(1500);
        assert_eq!(sync.echo_ttl(), Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [node]
            root = "/srv/share"
            role = "requester"

            [sync]
            interval_ms = 250
            join_timeout_secs = 30
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.root, PathBuf::from("/srv/share"));
        assert_eq!(config.node.role, SyncRole::Requester);
        assert_eq!(config.sync.interval_ms, 250);
        assert_eq!(config.sync.join_timeout(), Some(Duration::from_secs(30)));
        // Other values should be defaults
        assert_eq!(config.bus.token, "token");
        assert_eq!(config.sync.apply_attempts, 1);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[node]"));
        assert!(sample.contains("[sync]"));
        assert!(sample.contains("[bus]"));
        assert!(sample.contains("[server]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 4443);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.node.host_id = Some("alpha".into());
        config.bus.endpoints = vec!["ws://bus-1:4443".into(), "ws://bus-2:4443".into()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.node.host_id.as_deref(), Some("alpha"));
        assert_eq!(loaded.bus.endpoints.len(), 2);
    }

    #[test]
    fn test_sync_role_parse() {
        assert_eq!("Requester".parse::<SyncRole>().unwrap(), SyncRole::Requester);
        assert_eq!("none".parse::<SyncRole>().unwrap(), SyncRole::Disabled);
        assert!("both".parse::<SyncRole>().is_err());
        assert_eq!(SyncRole::Responder.to_string(), "responder");
    }
}

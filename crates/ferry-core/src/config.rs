//! Configuration system for Ferry
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/ferry/config.toml
//! - Linux: ~/.config/ferry/config.toml
//! - Windows: %APPDATA%/ferry/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Signaling room settings
    pub rooms: RoomConfig,
    /// Offline store settings
    pub offline: OfflineConfig,
    /// Connection-establishment client settings
    pub client: ClientConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// WebSocket signaling port
    pub signal_port: u16,
    /// HTTP API port
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            signal_port: 8080,
            http_port: 3000,
        }
    }
}

/// Signaling room configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Room lifetime in seconds
    pub max_age_secs: u64,
    /// Expiry sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_age_secs: crate::ROOM_MAX_AGE_SECS,
            sweep_interval_secs: crate::ROOM_SWEEP_INTERVAL_SECS,
        }
    }
}

impl RoomConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Offline store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Data directory (uses system data dir if None)
    pub data_dir: Option<PathBuf>,
    /// Transfer lifetime in seconds
    pub ttl_secs: u64,
    /// Downloads allowed per transfer
    pub max_downloads: u32,
    /// Files accepted per upload
    pub max_files: usize,
    /// Maximum upload body size in bytes (default 10GB)
    pub max_upload_bytes: u64,
    /// Expiry sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            ttl_secs: crate::OFFLINE_TTL_SECS,
            max_downloads: crate::DEFAULT_MAX_DOWNLOADS,
            max_files: 10,
            max_upload_bytes: 10 * 1024 * 1024 * 1024, // 10GB
            sweep_interval_secs: crate::OFFLINE_SWEEP_INTERVAL_SECS,
        }
    }
}

impl OfflineConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Connection-establishment client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling server URL
    pub signal_url: String,
    /// Seconds to wait for the peer connection to be established
    pub establish_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: "ws://127.0.0.1:8080".into(),
            establish_timeout_secs: crate::ESTABLISH_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.establish_timeout_secs)
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

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "ferry", "ferry").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "ferry", "ferry").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the effective data directory (config override or system default)
    pub fn data_dir(&self) -> PathBuf {
        self.offline
            .data_dir
            .clone()
            .or_else(Self::default_data_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp/ferry"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Failure to read or parse a configuration file
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(String),
    #[error("invalid config: {0}")]
    Parse(String),
}

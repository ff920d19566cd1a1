//! Configuration module
//!
//! Handles loading and saving the network process configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::MAX_CHUNK_SIZE;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Which name resolution strategy to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// Resolve through the runtime without stalling other requests
    #[default]
    Async,
    /// Resolve with a plain blocking lookup on the event loop thread
    Blocking,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TLS handshake timeout in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Per-address connect timeout in ms (unset: rely on the OS)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Name resolution strategy
    #[serde(default)]
    pub resolver: ResolverKind,
    /// Largest body slice per BodyChunk message
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Capacity of the inbound and outbound message queues
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_max_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            connect_timeout_ms: None,
            resolver: ResolverKind::default(),
            max_chunk_size: default_max_chunk_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Chunk size actually used, kept within one channel frame
    pub fn chunk_size(&self) -> usize {
        self.max_chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("spyglass/net.toml")),
            Some(PathBuf::from("./spyglass-net.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        network: NetworkConfig {
            connect_timeout_ms: Some(10_000),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

//! Configuration module
//!
//! Handles loading and saving node configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{NetworkConfig as RuntimeNetworkConfig, Watermarks};
use crate::protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};

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

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Security settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Chunked transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name this node announces as channel message sender
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Node-1".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            verbose: false,
            log_file: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Default timeout for queries in ms
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    /// Queued outbound bytes at which senders may resume
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Queued outbound bytes at which senders are throttled
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Concurrently running packet handlers (0 = derive from CPU count)
    #[serde(default)]
    pub dispatcher_workers: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_query_timeout() -> u64 {
    5000
}

fn default_low_watermark() -> usize {
    1024 * 1024
}

fn default_high_watermark() -> usize {
    8 * 1024 * 1024
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            query_timeout_ms: default_query_timeout(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            max_frame_size: default_max_frame_size(),
            dispatcher_workers: 0,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Wrap connections in TLS
    #[serde(default)]
    pub use_tls: bool,
    /// PKCS#12 identity used by the listening side
    pub identity: Option<PathBuf>,
    /// Password for the PKCS#12 identity
    #[serde(default)]
    pub identity_password: String,
    /// Accept self-signed peer certificates when connecting
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Chunked transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Channel messages above this size go through chunked transfer
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Sessions idle for longer than this are failed
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Largest payload one inbound session may reassemble, in bytes
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: u64,
    /// Reassemble into temporary files instead of memory
    #[serde(default = "default_true")]
    pub use_temp_files: bool,
}

fn default_chunk_size() -> u32 {
    crate::chunk::DEFAULT_CHUNK_SIZE
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_max_transfer_size() -> u64 {
    crate::chunk::DEFAULT_MAX_TRANSFER_SIZE
}

fn default_session_timeout() -> u64 {
    300
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_message_size: default_max_message_size(),
            session_timeout_secs: default_session_timeout(),
            max_transfer_size: default_max_transfer_size(),
            use_temp_files: default_true(),
        }
    }
}

impl TransferConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
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
            dirs::config_dir().map(|p| p.join("cloudnet/config.toml")),
            Some(PathBuf::from("./cloudnet.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
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

    /// Runtime network settings derived from this configuration
    pub fn network_config(&self) -> RuntimeNetworkConfig {
        let net = &self.network;
        let security = &self.security;
        let workers = if net.dispatcher_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4)
        } else {
            net.dispatcher_workers
        };

        RuntimeNetworkConfig {
            port: net.port,
            bind_address: net.bind_address.clone(),
            use_tls: security.use_tls,
            identity_path: security.identity.clone(),
            identity_password: security.identity_password.clone(),
            accept_invalid_certs: security.accept_invalid_certs,
            connect_timeout: Duration::from_millis(net.connect_timeout_ms),
            query_timeout: Duration::from_millis(net.query_timeout_ms),
            watermarks: Watermarks::new(net.low_watermark, net.high_watermark),
            max_frame_size: net.max_frame_size,
            dispatcher_workers: workers,
            ..Default::default()
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            node_name: "Node-1".to_string(),
            verbose: false,
            log_file: None,
        },
        security: SecurityConfig {
            use_tls: true,
            identity: Some(PathBuf::from("/etc/cloudnet/identity.p12")),
            identity_password: String::new(),
            accept_invalid_certs: false,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

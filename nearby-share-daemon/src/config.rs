//! Daemon Configuration
//!
//! TOML configuration for the Nearby Share daemon and its translation into
//! the engine's [`EngineConfig`].

use anyhow::{Context, Result};
use nearby_share_protocol::{
    config::{
        DEFAULT_ACK_TIMEOUT, DEFAULT_ADVERTISE_INTERVAL, DEFAULT_CHUNK_SIZE,
        DEFAULT_EMIT_EVERY_CHUNKS, DEFAULT_EMIT_INTERVAL, DEFAULT_HANDSHAKE_TIMEOUT,
        DEFAULT_PEER_TIMEOUT, DEFAULT_RETRY_BUDGET, DEFAULT_SEND_WINDOW,
    },
    transport::lan::{DEFAULT_DISCOVERY_PORT, DEFAULT_NOMINAL_SIGNAL_STRENGTH},
    DiscoveryConfig, EngineConfig, LanConfig, ProgressConfig, ProximityPolicy, TransferConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Transfer policy
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name shown to nearby devices
    pub name: String,

    /// Device ID (auto-generated and persisted if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP advertisement port
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP listen port (0 picks a free port)
    #[serde(default)]
    pub transfer_port: u16,

    /// Advertisement interval in seconds
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval: u64,

    /// Seconds of silence before a peer is considered gone
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout: u64,

    /// Signal strength assumed for peers heard on the LAN
    #[serde(default = "default_signal_strength")]
    pub signal_strength: u8,

    /// Minimum strength for the `immediate` bucket
    #[serde(default = "default_immediate_threshold")]
    pub immediate_threshold: u8,

    /// Minimum strength for the `near` bucket
    #[serde(default = "default_near_threshold")]
    pub near_threshold: u8,
}

/// Transfer policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Accept offers without asking
    #[serde(default)]
    pub auto_accept: bool,

    /// Payload bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Unacknowledged chunks the sender may keep in flight
    #[serde(default = "default_send_window")]
    pub send_window: usize,

    /// Retransmissions allowed per file
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Seconds the receiver has to answer an offer
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds to wait for an acknowledgement
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,

    /// Minimum milliseconds between progress updates
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Chunks that force a progress update
    #[serde(default = "default_progress_every_chunks")]
    pub progress_every_chunks: u32,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (history, device ID)
    pub data_dir: PathBuf,

    /// Where received files are written
    pub receive_dir: PathBuf,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_advertise_interval() -> u64 {
    DEFAULT_ADVERTISE_INTERVAL.as_secs()
}

fn default_peer_timeout() -> u64 {
    DEFAULT_PEER_TIMEOUT.as_secs()
}

fn default_signal_strength() -> u8 {
    DEFAULT_NOMINAL_SIGNAL_STRENGTH
}

fn default_immediate_threshold() -> u8 {
    ProximityPolicy::default().immediate_threshold
}

fn default_near_threshold() -> u8 {
    ProximityPolicy::default().near_threshold
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_send_window() -> usize {
    DEFAULT_SEND_WINDOW
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_ack_timeout() -> u64 {
    DEFAULT_ACK_TIMEOUT.as_secs()
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_EMIT_INTERVAL.as_millis() as u64
}

fn default_progress_every_chunks() -> u32 {
    DEFAULT_EMIT_EVERY_CHUNKS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transfer_port: 0,
            advertise_interval: default_advertise_interval(),
            peer_timeout: default_peer_timeout(),
            signal_strength: default_signal_strength(),
            immediate_threshold: default_immediate_threshold(),
            near_threshold: default_near_threshold(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            auto_accept: false,
            chunk_size: default_chunk_size(),
            send_window: default_send_window(),
            retry_budget: default_retry_budget(),
            handshake_timeout: default_handshake_timeout(),
            ack_timeout: default_ack_timeout(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_every_chunks: default_progress_every_chunks(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("nearby-share");

        let receive_dir = dirs::download_dir()
            .unwrap_or_else(|| PathBuf::from("Downloads"))
            .join("Nearby Share");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_id: None,
            },
            network: NetworkConfig::default(),
            transfer: TransferSettings::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                receive_dir,
            },
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("nearby-share")
}

/// Default location of the configuration file
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

impl Config {
    /// Load configuration from `path`, creating a default file if not found
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.receive_dir)
            .context("Failed to create receive directory")?;
        Ok(())
    }

    /// Persisted transfer history
    pub fn history_path(&self) -> PathBuf {
        self.paths.data_dir.join("history.json")
    }

    /// Get the device ID file path (for persisting auto-generated device IDs)
    pub fn device_id_path(&self) -> PathBuf {
        self.paths.data_dir.join("device_id")
    }

    /// Load device ID from config or saved file
    ///
    /// The config file setting wins over the saved file.
    pub fn load_device_id(&self) -> Option<String> {
        if let Some(ref id) = self.device.device_id {
            return Some(id.clone());
        }

        let device_id_path = self.device_id_path();
        let id = fs::read_to_string(&device_id_path).ok()?;
        let id = id.trim().to_string();
        if id.is_empty() {
            None
        } else {
            tracing::debug!("Loaded device ID from {}", device_id_path.display());
            Some(id)
        }
    }

    /// Save a generated device ID to file
    pub fn save_device_id(&self, device_id: &str) -> Result<()> {
        let device_id_path = self.device_id_path();

        if let Some(parent) = device_id_path.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        fs::write(&device_id_path, device_id).context("Failed to save device ID")?;
        tracing::info!("Saved device ID to {}", device_id_path.display());
        Ok(())
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        let network = &self.network;
        let transfer = &self.transfer;

        EngineConfig {
            discovery: DiscoveryConfig {
                advertise_interval: Duration::from_secs(network.advertise_interval),
                peer_timeout: Duration::from_secs(network.peer_timeout),
                ..DiscoveryConfig::default()
            },
            transfer: TransferConfig {
                chunk_size: transfer.chunk_size,
                send_window: transfer.send_window,
                retry_budget: transfer.retry_budget,
                handshake_timeout: Duration::from_secs(transfer.handshake_timeout),
                ack_timeout: Duration::from_secs(transfer.ack_timeout),
                auto_accept: transfer.auto_accept,
            },
            progress: ProgressConfig {
                emit_interval: Duration::from_millis(transfer.progress_interval_ms),
                emit_every_chunks: transfer.progress_every_chunks,
                ..ProgressConfig::default()
            },
            proximity: ProximityPolicy {
                immediate_threshold: network.immediate_threshold,
                near_threshold: network.near_threshold,
            },
        }
    }

    /// LAN transport settings derived from this configuration
    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            discovery_port: self.network.discovery_port,
            tcp_port: self.network.transfer_port,
            nominal_signal_strength: self.network.signal_strength,
            ..LanConfig::default()
        }
    }
}

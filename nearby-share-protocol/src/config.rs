//! Engine Configuration
//!
//! Policy constants for discovery, transfer and progress reporting. Every
//! value has a named default and can be overridden by the embedding
//! application before the engine is constructed.

use crate::device::ProximityPolicy;
use crate::wire::MAX_PAYLOAD_SIZE;
use crate::{ProtocolError, Result};
use std::time::Duration;

/// Default chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of unacknowledged chunks the sender may keep in flight
pub const DEFAULT_SEND_WINDOW: usize = 8;

/// Largest send window the engine accepts
pub const MAX_SEND_WINDOW: usize = 1024;

/// Default retransmissions allowed per file before the session fails
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default time the responder has to accept or reject a manifest
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for a chunk or final acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default advertisement interval
pub const DEFAULT_ADVERTISE_INTERVAL: Duration = Duration::from_secs(3);

/// Default liveness window (peer removed after this much silence)
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(20);

/// Default first delay after a failed discovery scan
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Default ceiling for the discovery retry delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default minimum interval between progress publications
pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_millis(250);

/// Default chunk count that forces a progress publication
pub const DEFAULT_EMIT_EVERY_CHUNKS: u32 = 16;

/// Default smoothing window for the throughput average
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_millis(1500);

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often this device re-advertises itself
    pub advertise_interval: Duration,

    /// How long a peer may stay silent before it is dropped
    pub peer_timeout: Duration,

    /// How often the liveness sweep runs
    pub sweep_interval: Duration,

    /// First retry delay after a scan error
    pub backoff_initial: Duration,

    /// Retry delay ceiling
    pub backoff_max: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertise_interval: DEFAULT_ADVERTISE_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Chunk pipeline and negotiation configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per chunk
    pub chunk_size: usize,

    /// Maximum unacknowledged chunks held by the sender
    pub send_window: usize,

    /// Retransmissions allowed per file
    pub retry_budget: u32,

    /// Manifest accept/reject deadline
    pub handshake_timeout: Duration,

    /// Chunk and final acknowledgement deadline
    pub ack_timeout: Duration,

    /// Accept incoming offers without waiting for `accept_incoming`
    pub auto_accept: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_window: DEFAULT_SEND_WINDOW,
            retry_budget: DEFAULT_RETRY_BUDGET,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            auto_accept: false,
        }
    }
}

/// Progress reporting configuration
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Minimum time between two published snapshots
    pub emit_interval: Duration,

    /// Publish after this many chunks even if the interval has not elapsed
    pub emit_every_chunks: u32,

    /// Time constant of the exponentially smoothed speed
    pub speed_window: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            emit_interval: DEFAULT_EMIT_INTERVAL,
            emit_every_chunks: DEFAULT_EMIT_EVERY_CHUNKS,
            speed_window: DEFAULT_SPEED_WINDOW,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Discovery and liveness
    pub discovery: DiscoveryConfig,

    /// Negotiation and chunk pipeline
    pub transfer: TransferConfig,

    /// Progress cadence and smoothing
    pub progress: ProgressConfig,

    /// Signal strength to proximity bucket mapping
    pub proximity: ProximityPolicy,
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;

        if transfer.chunk_size == 0 {
            return Err(ProtocolError::Configuration(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if transfer.chunk_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Configuration(format!(
                "chunk_size {} exceeds wire maximum {}",
                transfer.chunk_size, MAX_PAYLOAD_SIZE
            )));
        }
        if transfer.send_window == 0 {
            return Err(ProtocolError::Configuration(
                "send_window must be at least 1".to_string(),
            ));
        }
        if transfer.send_window > MAX_SEND_WINDOW {
            return Err(ProtocolError::Configuration(format!(
                "send_window {} exceeds maximum {}",
                transfer.send_window, MAX_SEND_WINDOW
            )));
        }
        if self.discovery.advertise_interval.is_zero() || self.discovery.sweep_interval.is_zero() {
            return Err(ProtocolError::Configuration(
                "advertise_interval and sweep_interval must be non-zero".to_string(),
            ));
        }
        if self.discovery.backoff_initial > self.discovery.backoff_max {
            return Err(ProtocolError::Configuration(
                "backoff_initial must not exceed backoff_max".to_string(),
            ));
        }
        self.proximity.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.transfer.retry_budget, 3);
        assert_eq!(config.transfer.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.discovery.backoff_max, Duration::from_secs(30));
        assert!(!config.transfer.auto_accept);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = EngineConfig::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let mut config = EngineConfig::default();
        config.transfer.chunk_size = MAX_PAYLOAD_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_window() {
        let mut config = EngineConfig::default();
        config.transfer.send_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_window() {
        let mut config = EngineConfig::default();
        config.transfer.send_window = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::Configuration(_))
        ));

        config.transfer.send_window = MAX_SEND_WINDOW + 1;
        assert!(config.validate().is_err());

        config.transfer.send_window = MAX_SEND_WINDOW;
        assert!(config.validate().is_ok());
    }
}

//! Error handling for the nearby share engine
//!
//! This module provides a single error type for every engine operation.
//! Errors from underlying libraries are converted automatically using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Session Errors
//! The outcomes that end a transfer session:
//! - `Transport`: connect/read/write failure on the duplex channel
//! - `HandshakeRejected`: the responder declined the manifest
//! - `HandshakeTimeout`: the responder did not answer in time
//! - `Integrity`: checksum mismatches exhausted the retransmission budget
//! - `Cancelled`: user-initiated cancellation
//!
//! ### Request Errors
//! Returned synchronously to the caller and never touching session state:
//! - `SessionBusy`: a session to the same peer is already active
//! - `TransferInProgress`: another peer holds the engine's transfer slot
//! - `NoFilesSelected`, `NoPendingOffer`, `DeviceNotFound`
//!
//! ### Wire Errors
//! - `InvalidPacket`: malformed frame
//! - `PacketSizeExceeded`: frame larger than the wire maximum
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::{error, warn};
//!
//! if let Err(e) = registry.start_discovery().await {
//!     warn!("Discovery start failed, retrying: {}", e);
//! }
//! ```

use crate::session::FailureKind;
use thiserror::Error;

/// Result type for engine operations
///
/// # Examples
///
/// ```rust
/// use nearby_share_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during engine operations
///
/// # Examples
///
/// ```rust
/// use nearby_share_protocol::ProtocolError;
///
/// let error = ProtocolError::SessionBusy("pixel_7".to_string());
/// assert_eq!(error.to_string(), "Session busy: a transfer with pixel_7 is already active");
///
/// let error = ProtocolError::HandshakeTimeout;
/// assert_eq!(error.to_string(), "Handshake timeout: peer did not answer the manifest");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, sockets)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport layer error (connect, read, write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The responder declined the manifest
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The responder did not accept or reject within the handshake timeout
    #[error("Handshake timeout: peer did not answer the manifest")]
    HandshakeTimeout,

    /// Checksum mismatches exceeded the per-file retransmission budget
    #[error("Integrity error: file {file} failed verification after {attempts} retransmissions")]
    Integrity {
        /// Index of the file in the manifest
        file: u32,
        /// Retransmissions attempted before giving up
        attempts: u32,
    },

    /// A session to the same peer is already active
    #[error("Session busy: a transfer with {0} is already active")]
    SessionBusy(String),

    /// Another peer already owns the engine's transfer slot
    #[error("Transfer in progress with {0}")]
    TransferInProgress(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Operation timed out (acknowledgement, read)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or malformed frame
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Frame payload exceeds the maximum allowed size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Peer not present in the registry or transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// `send_to` called without a file selection
    #[error("No files selected")]
    NoFilesSelected,

    /// `accept_incoming` called with no pending offer
    #[error("No pending incoming offer")]
    NoPendingOffer,

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource exhausted (disk full)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific error
    ///
    /// Connection-level failures become `Transport`, timeouts become
    /// `Timeout`, everything else stays `Io`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nearby_share_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to peer");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                ProtocolError::Transport(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and may succeed on retry
    ///
    /// Only classifies the error. Discovery retries every scan failure with
    /// backoff regardless, and a failed session is never retried.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nearby_share_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Transport("reset".to_string()).is_recoverable());
    /// assert!(!ProtocolError::HandshakeTimeout.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_) | ProtocolError::Timeout(_) | ProtocolError::Io(_)
        )
    }

    /// Map this error to the failure kind recorded on a failed session
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProtocolError::HandshakeRejected(reason) => {
                FailureKind::HandshakeRejected(reason.clone())
            }
            ProtocolError::HandshakeTimeout => FailureKind::HandshakeTimeout,
            ProtocolError::Integrity { file, .. } => FailureKind::Integrity { file: *file },
            ProtocolError::Timeout(msg) => FailureKind::Timeout(msg.clone()),
            ProtocolError::InvalidPacket(msg) => FailureKind::Protocol(msg.clone()),
            ProtocolError::PacketSizeExceeded(size, max) => {
                FailureKind::Protocol(format!("frame of {} bytes exceeds {}", size, max))
            }
            ProtocolError::Io(e) => FailureKind::Storage(e.to_string()),
            ProtocolError::PermissionDenied(msg) | ProtocolError::ResourceExhausted(msg) => {
                FailureKind::Storage(msg.clone())
            }
            other => FailureKind::Transport(other.to_string()),
        }
    }

    /// Get a user-friendly error message suitable for display in UI
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nearby_share_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::HandshakeRejected("declined".to_string());
    /// assert_eq!(error.user_message(), "The other device declined the transfer.");
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::Transport(_) => {
                "Connection to the other device was lost. Move closer and try again.".to_string()
            }
            ProtocolError::HandshakeRejected(_) => {
                "The other device declined the transfer.".to_string()
            }
            ProtocolError::HandshakeTimeout => {
                "The other device did not respond. Check that it is awake and nearby.".to_string()
            }
            ProtocolError::Integrity { .. } => {
                "Received data was corrupted repeatedly. Try sending again.".to_string()
            }
            ProtocolError::SessionBusy(_) => {
                "A transfer with this device is already in progress.".to_string()
            }
            ProtocolError::TransferInProgress(_) => {
                "Another transfer is in progress. Wait for it to finish.".to_string()
            }
            ProtocolError::Cancelled(_) => "Transfer cancelled.".to_string(),
            ProtocolError::Timeout(msg) => format!("Timed out: {}.", msg),
            ProtocolError::NoFilesSelected => "Select at least one file to send.".to_string(),
            ProtocolError::NoPendingOffer => "There is no incoming transfer to accept.".to_string(),
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' is no longer nearby.", id)
            }
            ProtocolError::ResourceExhausted(msg) => {
                format!("Resource exhausted: {}. Free up space and try again.", msg)
            }
            ProtocolError::PermissionDenied(msg) => {
                format!(
                    "Permission denied: {}. Check file and directory permissions.",
                    msg
                )
            }
            other => other.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }
}

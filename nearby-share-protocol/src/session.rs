//! Transfer Session Model
//!
//! The session record owned by the transfer controller, its forward-only
//! state machine, and the file descriptors that make up a manifest.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Discovering → Connecting → Handshaking → Ready → Transferring → Completed
//!   └──────────────┴────────────┴─────────────┴───────┴──────────────→ Failed | Cancelled
//! ```
//!
//! States may be skipped (a receiver starts at `Handshaking`) but never
//! revisited. `Completed` is reachable only from `Transferring`.

use crate::device::PeerDevice;
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild a session ID from its wire bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Wire representation
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the transfer this engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Opaque reference understood by the file storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle(String);

impl FileHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

impl From<String> for FileHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&Path> for FileHandle {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for FileHandle {
    fn from(path: PathBuf) -> Self {
        Self::from(path.as_path())
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad media category, guessed from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl MediaKind {
    /// Guess the media kind of a file name
    pub fn from_name(name: &str) -> Self {
        let extension = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => return MediaKind::Other,
        };

        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "bmp" | "svg" => MediaKind::Image,
            "mp4" | "mkv" | "mov" | "webm" | "avi" => MediaKind::Video,
            "mp3" | "flac" | "ogg" | "wav" | "m4a" | "opus" => MediaKind::Audio,
            "pdf" | "txt" | "md" | "doc" | "docx" | "odt" | "xls" | "xlsx" | "csv" => {
                MediaKind::Document
            }
            "zip" | "tar" | "gz" | "xz" | "7z" | "rar" | "zst" => MediaKind::Archive,
            _ => MediaKind::Other,
        }
    }
}

/// One file of a manifest
///
/// Immutable once a session has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Storage handle (sender side) or assigned name (receiver side)
    pub handle: FileHandle,

    /// File name transmitted in the manifest
    pub name: String,

    /// Exact size in bytes
    pub byte_size: u64,

    /// Media category
    pub media_kind: MediaKind,
}

impl FileDescriptor {
    pub fn new(handle: FileHandle, name: impl Into<String>, byte_size: u64) -> Self {
        let name = name.into();
        Self {
            handle,
            media_kind: MediaKind::from_name(&name),
            name,
            byte_size,
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Discovering,
    Connecting,
    Handshaking,
    Ready,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Idle => 0,
            SessionStatus::Discovering => 1,
            SessionStatus::Connecting => 2,
            SessionStatus::Handshaking => 3,
            SessionStatus::Ready => 4,
            SessionStatus::Transferring => 5,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled => 6,
        }
    }

    /// Whether `self → next` is a legal transition
    pub fn can_advance_to(&self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionStatus::Failed | SessionStatus::Cancelled => true,
            SessionStatus::Completed => *self == SessionStatus::Transferring,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Discovering => "discovering",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Handshaking => "handshaking",
            SessionStatus::Ready => "ready",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum FailureKind {
    /// Connect/read/write failure or peer vanished
    Transport(String),
    /// Responder declined the manifest
    HandshakeRejected(String),
    /// Responder never answered the manifest
    HandshakeTimeout,
    /// Retransmission budget exhausted for a file
    Integrity { file: u32 },
    /// Acknowledgement or read deadline missed
    Timeout(String),
    /// Peer violated the wire protocol
    Protocol(String),
    /// Local storage could not read or persist a file
    Storage(String),
}

/// One transfer between this engine and a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub session_id: SessionId,
    pub role: Role,
    pub peer: PeerDevice,
    pub files: Vec<FileDescriptor>,
    pub current_file_index: usize,
    pub bytes_transferred_total: u64,
    pub total_bytes: u64,
    /// Smoothed throughput in bytes per second
    pub instantaneous_speed: f64,
    /// Estimated time remaining, absent while the speed is zero
    pub eta: Option<Duration>,
    pub status: SessionStatus,
    pub failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
}

impl TransferSession {
    /// Create a new session in `Idle`
    pub fn new(
        session_id: SessionId,
        role: Role,
        peer: PeerDevice,
        files: Vec<FileDescriptor>,
    ) -> Self {
        let total_bytes = files.iter().map(|f| f.byte_size).sum();
        Self {
            session_id,
            role,
            peer,
            files,
            current_file_index: 0,
            bytes_transferred_total: 0,
            total_bytes,
            instantaneous_speed: 0.0,
            eta: None,
            status: SessionStatus::Idle,
            failure: None,
            started_at: Utc::now(),
        }
    }

    /// Fraction transferred in `[0, 1]`; zero for an empty manifest
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_transferred_total as f64 / self.total_bytes as f64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the state machine forward
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for backward moves, moves out of a terminal
    /// state, and `Completed` from anything but `Transferring`.
    pub fn advance(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(ProtocolError::invalid_state(format!(
                "session {}: illegal transition {} -> {}",
                self.session_id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.instantaneous_speed = 0.0;
            self.eta = None;
        }
        Ok(())
    }

    /// Mark the session failed with the given reason
    pub fn fail(&mut self, failure: FailureKind) -> Result<()> {
        self.advance(SessionStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Set the byte counter; it never moves backwards or past the total
    pub fn set_bytes_transferred(&mut self, bytes: u64) -> Result<()> {
        if bytes < self.bytes_transferred_total || bytes > self.total_bytes {
            return Err(ProtocolError::invalid_state(format!(
                "byte counter {} outside [{}, {}]",
                bytes, self.bytes_transferred_total, self.total_bytes
            )));
        }
        self.bytes_transferred_total = bytes;
        Ok(())
    }

    /// Set the current file index; it never moves backwards or past the file count
    pub fn set_current_file(&mut self, index: usize) -> Result<()> {
        if index < self.current_file_index || index > self.files.len() {
            return Err(ProtocolError::invalid_state(format!(
                "file index {} outside [{}, {}]",
                index,
                self.current_file_index,
                self.files.len()
            )));
        }
        self.current_file_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ProximityBucket;

    fn peer() -> PeerDevice {
        PeerDevice {
            id: "phone_1".to_string(),
            display_name: "Phone".to_string(),
            signal_strength: 80,
            proximity_bucket: ProximityBucket::Immediate,
        }
    }

    fn session(sizes: &[u64]) -> TransferSession {
        let files = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| FileDescriptor::new(FileHandle::new(format!("f{}", i)), format!("f{}.bin", i), *size))
            .collect();
        TransferSession::new(SessionId::new(), Role::Sender, peer(), files)
    }

    #[test]
    fn test_full_forward_path() {
        let mut s = session(&[10]);
        for next in [
            SessionStatus::Connecting,
            SessionStatus::Handshaking,
            SessionStatus::Ready,
            SessionStatus::Transferring,
            SessionStatus::Completed,
        ] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut s = session(&[10]);
        s.advance(SessionStatus::Handshaking).unwrap();
        assert!(s.advance(SessionStatus::Connecting).is_err());
        assert!(s.advance(SessionStatus::Handshaking).is_err());
        assert_eq!(s.status, SessionStatus::Handshaking);
    }

    #[test]
    fn test_completed_only_from_transferring() {
        let mut s = session(&[10]);
        s.advance(SessionStatus::Ready).unwrap();
        assert!(s.advance(SessionStatus::Completed).is_err());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut s = session(&[10]);
        s.advance(SessionStatus::Cancelled).unwrap();
        assert!(s.advance(SessionStatus::Failed).is_err());
        assert!(s.fail(FailureKind::HandshakeTimeout).is_err());
        assert_eq!(s.status, SessionStatus::Cancelled);
        assert!(s.failure.is_none());
    }

    #[test]
    fn test_counters_monotonic_and_bounded() {
        let mut s = session(&[600, 400]);
        assert_eq!(s.total_bytes, 1000);
        s.set_bytes_transferred(400).unwrap();
        assert!(s.set_bytes_transferred(300).is_err());
        assert!(s.set_bytes_transferred(1001).is_err());
        assert_eq!(s.progress(), 0.4);

        s.set_current_file(1).unwrap();
        assert!(s.set_current_file(0).is_err());
        s.set_current_file(2).unwrap();
        assert!(s.set_current_file(3).is_err());
    }

    #[test]
    fn test_progress_zero_for_empty_manifest() {
        let s = session(&[0, 0]);
        assert_eq!(s.total_bytes, 0);
        assert_eq!(s.progress(), 0.0);
    }

    #[test]
    fn test_media_kind_guess() {
        assert_eq!(MediaKind::from_name("holiday.JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_name("notes.txt"), MediaKind::Document);
        assert_eq!(MediaKind::from_name("backup.tar"), MediaKind::Archive);
        assert_eq!(MediaKind::from_name(".bashrc"), MediaKind::Other);
        assert_eq!(MediaKind::from_name("README"), MediaKind::Other);
    }

    #[test]
    fn test_session_id_wire_round_trip() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_bytes(*id.as_bytes()), id);
    }
}

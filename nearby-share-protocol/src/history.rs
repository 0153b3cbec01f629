//! History Ledger
//!
//! Append-only audit log of finished sessions. Every terminal session is
//! recorded exactly once, whatever its outcome; records are never updated
//! or deleted.
//!
//! The ledger is in-memory and observable. When opened with
//! [`HistoryLedger::with_storage`] it is also backed by a JSON file that is
//! loaded on open and rewritten after every append.

use crate::session::{FailureKind, Role, SessionId, SessionStatus, TransferSession};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which way the files went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl From<Role> for Direction {
    fn from(role: Role) -> Self {
        match role {
            Role::Sender => Direction::Sent,
            Role::Receiver => Direction::Received,
        }
    }
}

/// Name and size of one file in a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFile {
    pub name: String,
    pub size: u64,
}

/// Immutable audit entry for a terminal session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub session_id: SessionId,
    pub peer_id: String,
    pub peer_name: String,
    pub direction: Direction,
    pub files: Vec<HistoryFile>,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub final_status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl HistoryRecord {
    /// Derive a record from a terminal session
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the session has not ended.
    pub fn from_session(session: &TransferSession) -> Result<Self> {
        if !session.is_terminal() {
            return Err(ProtocolError::invalid_state(format!(
                "session {} is still {}",
                session.session_id, session.status
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.session_id,
            peer_id: session.peer.id.clone(),
            peer_name: session.peer.display_name.clone(),
            direction: session.role.into(),
            files: session
                .files
                .iter()
                .map(|f| HistoryFile {
                    name: f.name.clone(),
                    size: f.byte_size,
                })
                .collect(),
            total_size: session.total_bytes,
            bytes_transferred: session.bytes_transferred_total,
            started_at: session.started_at,
            timestamp: Utc::now(),
            final_status: session.status,
            failure: session.failure.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Append order
    records: Vec<HistoryRecord>,
    recorded_sessions: HashSet<SessionId>,
}

impl LedgerState {
    fn newest_first(&self) -> Vec<HistoryRecord> {
        let mut records: Vec<HistoryRecord> = self.records.iter().rev().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }
}

/// Append-only, observable history of terminal sessions
#[derive(Debug)]
pub struct HistoryLedger {
    state: Mutex<LedgerState>,
    storage_path: Option<PathBuf>,
    updates: watch::Sender<Vec<HistoryRecord>>,
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLedger {
    /// Create an in-memory ledger
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(LedgerState::default()),
            storage_path: None,
            updates,
        }
    }

    /// Open a ledger backed by a JSON file
    ///
    /// A missing file starts an empty ledger. An unreadable one is moved
    /// aside to `<path>.corrupt` so its contents are not overwritten.
    pub async fn with_storage(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = LedgerState::default();

        match fs::read_to_string(&path).await {
            Ok(json) => match serde_json::from_str::<Vec<HistoryRecord>>(&json) {
                Ok(records) => {
                    for record in &records {
                        state.recorded_sessions.insert(record.session_id);
                    }
                    state.records = records;
                    info!(
                        "Restored {} history records from {}",
                        state.records.len(),
                        path.display()
                    );
                }
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    warn!(
                        "History file {} is unreadable ({}), moving it to {}",
                        path.display(),
                        e,
                        backup.display()
                    );
                    fs::rename(&path, &backup).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No history file at {}, starting fresh", path.display());
            }
            Err(e) => {
                return Err(ProtocolError::from_io_error(
                    e,
                    &format!("reading history file {}", path.display()),
                ))
            }
        }

        let (updates, _) = watch::channel(state.newest_first());
        Ok(Self {
            state: Mutex::new(state),
            storage_path: Some(path),
            updates,
        })
    }

    /// Append the record of a terminal session
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the session is not terminal or was
    /// already recorded. A failure to rewrite the backing file is logged
    /// and the record is kept in memory.
    pub async fn record_completion(&self, session: &TransferSession) -> Result<HistoryRecord> {
        let record = HistoryRecord::from_session(session)?;

        let mut state = self.state.lock().await;
        if !state.recorded_sessions.insert(session.session_id) {
            return Err(ProtocolError::invalid_state(format!(
                "session {} already recorded",
                session.session_id
            )));
        }
        state.records.push(record.clone());

        info!(
            "History: {} {:?} with {} ({} files, {} bytes)",
            record.final_status,
            record.direction,
            record.peer_name,
            record.files.len(),
            record.total_size
        );

        if let Some(path) = &self.storage_path {
            if let Err(e) = Self::persist(path, &state.records).await {
                warn!("Failed to save history to {}: {}", path.display(), e);
            }
        }

        self.updates.send_replace(state.newest_first());
        Ok(record)
    }

    /// All records, newest first
    pub async fn list_history(&self) -> Vec<HistoryRecord> {
        self.state.lock().await.newest_first()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Observe the list, newest first
    pub fn subscribe(&self) -> watch::Receiver<Vec<HistoryRecord>> {
        self.updates.subscribe()
    }

    async fn persist(path: &Path, records: &[HistoryRecord]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        debug!("Saved {} history records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PeerDevice, ProximityBucket};
    use crate::session::{FileDescriptor, FileHandle};
    use tempfile::TempDir;

    fn terminal_session(status: SessionStatus) -> TransferSession {
        let peer = PeerDevice {
            id: "phone_1".to_string(),
            display_name: "Phone".to_string(),
            signal_strength: 50,
            proximity_bucket: ProximityBucket::Near,
        };
        let files = vec![FileDescriptor::new(FileHandle::new("a.txt"), "a.txt", 1000)];
        let mut session = TransferSession::new(SessionId::new(), Role::Receiver, peer, files);
        session.advance(SessionStatus::Transferring).unwrap();
        match status {
            SessionStatus::Failed => session.fail(FailureKind::HandshakeTimeout).unwrap(),
            other => session.advance(other).unwrap(),
        }
        session
    }

    #[tokio::test]
    async fn test_record_once_per_session() {
        let ledger = HistoryLedger::new();
        let session = terminal_session(SessionStatus::Cancelled);

        let record = ledger.record_completion(&session).await.unwrap();
        assert_eq!(record.final_status, SessionStatus::Cancelled);
        assert_eq!(record.direction, Direction::Received);
        assert_eq!(record.files[0].name, "a.txt");

        assert!(matches!(
            ledger.record_completion(&session).await,
            Err(ProtocolError::InvalidState(_))
        ));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_non_terminal_session_rejected() {
        let ledger = HistoryLedger::new();
        let peer = PeerDevice {
            id: "p".to_string(),
            display_name: "P".to_string(),
            signal_strength: 0,
            proximity_bucket: ProximityBucket::Far,
        };
        let session = TransferSession::new(SessionId::new(), Role::Sender, peer, Vec::new());
        assert!(ledger.record_completion(&session).await.is_err());
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_observable() {
        let ledger = HistoryLedger::new();
        let mut updates = ledger.subscribe();

        let first = terminal_session(SessionStatus::Completed);
        let second = terminal_session(SessionStatus::Failed);
        ledger.record_completion(&first).await.unwrap();
        ledger.record_completion(&second).await.unwrap();

        let list = ledger.list_history().await;
        assert_eq!(list[0].session_id, second.session_id);
        assert_eq!(list[1].session_id, first.session_id);
        assert_eq!(list[0].failure, Some(FailureKind::HandshakeTimeout));

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().len(), 2);
    }

    #[tokio::test]
    async fn test_json_backing_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/history.json");

        let session = terminal_session(SessionStatus::Completed);
        {
            let ledger = HistoryLedger::with_storage(&path).await.unwrap();
            ledger.record_completion(&session).await.unwrap();
        }

        let reopened = HistoryLedger::with_storage(&path).await.unwrap();
        let list = reopened.list_history().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].session_id, session.session_id);
        assert_eq!(reopened.subscribe().borrow().len(), 1);

        // the restored session cannot be recorded twice
        assert!(reopened.record_completion(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let ledger = HistoryLedger::with_storage(&path).await.unwrap();
        assert!(ledger.is_empty().await);
        assert!(temp.path().join("history.json.corrupt").exists());
    }
}

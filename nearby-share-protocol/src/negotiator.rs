//! Session Negotiator
//!
//! Manifest handshake between an initiator and a responder, plus the slot
//! that limits the engine to one active session at a time.
//!
//! ## Handshake
//!
//! ```text
//! initiator                          responder
//!     | ---------- Manifest ---------->  |
//!     |                                  |  (user decides, or auto-accept)
//!     | <--- ManifestAccept / Reject --- |
//! ```
//!
//! The initiator waits at most `handshake_timeout` for the answer. The
//! responder holds an offer slightly longer than that, so an unanswered
//! offer always times out on the initiator first and the responder then
//! sees the channel close.

use crate::config::TransferConfig;
use crate::device::LocalIdentity;
use crate::session::{FileDescriptor, FileHandle, SessionId};
use crate::storage::sanitize_file_name;
use crate::transport::DuplexChannel;
use crate::wire::{send_frame, Frame, FrameReader, Manifest, ManifestEntry};
use crate::{ProtocolError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reason sent when an offer arrives while another session is active
pub const BUSY_REJECT_REASON: &str = "busy";

/// Extra time the responder holds an offer beyond the handshake timeout
pub const OFFER_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct ActiveSession {
    peer_id: String,
    session_id: SessionId,
    cancel: CancellationToken,
}

/// The engine's single transfer slot
///
/// Reserving returns a [`SlotGuard`]; the slot is free again once the guard
/// is dropped.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a session with `peer_id`
    ///
    /// # Errors
    ///
    /// `SessionBusy` if a session with the same peer is active,
    /// `TransferInProgress` if another peer holds the slot. Neither error
    /// touches the active session.
    pub fn try_reserve(
        &self,
        peer_id: &str,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<SlotGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            return Err(if current.peer_id == peer_id {
                ProtocolError::SessionBusy(peer_id.to_string())
            } else {
                ProtocolError::TransferInProgress(current.peer_id.clone())
            });
        }

        *active = Some(ActiveSession {
            peer_id: peer_id.to_string(),
            session_id,
            cancel,
        });
        debug!("Session {} reserved the transfer slot for {}", session_id, peer_id);

        Ok(SlotGuard {
            active: Arc::clone(&self.active),
            session_id,
        })
    }

    /// Signal cancellation to the session holding the slot
    ///
    /// Returns false if `session_id` does not hold the slot, which includes
    /// sessions that already ended.
    pub fn cancel(&self, session_id: SessionId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(current) if current.session_id == session_id => {
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel whatever session holds the slot
    pub fn cancel_active(&self) -> Option<SessionId> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|current| {
            current.cancel.cancel();
            current.session_id
        })
    }

    /// Peer of the session holding the slot
    pub fn active_peer(&self) -> Option<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|current| current.peer_id.clone())
    }

    #[cfg(test)]
    fn is_free(&self) -> bool {
        self.active_peer().is_none()
    }
}

/// Holds the transfer slot for one session
#[derive(Debug)]
pub struct SlotGuard {
    active: Arc<Mutex<Option<ActiveSession>>>,
    session_id: SessionId,
}

impl SlotGuard {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .as_ref()
            .is_some_and(|current| current.session_id == self.session_id)
        {
            *active = None;
            debug!("Session {} released the transfer slot", self.session_id);
        }
    }
}

/// How a held offer ended
#[derive(Debug)]
pub enum OfferOutcome<T> {
    /// The local user (or auto-accept) decided
    Decided(T),
    /// Nobody decided before the offer expired
    Expired,
    /// The initiator cancelled or went away
    Withdrawn(String),
    /// The decision handle was dropped without a decision
    Abandoned,
}

/// Build the manifest this device offers
pub fn manifest_for(
    identity: &LocalIdentity,
    session_id: SessionId,
    files: &[FileDescriptor],
) -> Manifest {
    Manifest {
        session_id,
        sender_id: identity.device_id.clone(),
        sender_name: identity.display_name.clone(),
        files: files
            .iter()
            .map(|f| ManifestEntry {
                name: f.name.clone(),
                size: f.byte_size,
            })
            .collect(),
    }
}

/// Describe the files of a received manifest
///
/// Names are sanitised here so nothing downstream sees a path.
pub fn files_from_manifest(manifest: &Manifest) -> Vec<FileDescriptor> {
    manifest
        .files
        .iter()
        .map(|entry| {
            let name = sanitize_file_name(&entry.name);
            FileDescriptor::new(FileHandle::new(name.clone()), name, entry.size)
        })
        .collect()
}

/// Runs the manifest handshake on an open channel
#[derive(Debug, Clone)]
pub struct SessionNegotiator {
    config: TransferConfig,
    cancel: CancellationToken,
}

impl SessionNegotiator {
    pub fn new(config: TransferConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Offer a manifest and wait for the responder's answer
    ///
    /// # Errors
    ///
    /// `HandshakeRejected` with the peer's reason, `HandshakeTimeout` if no
    /// answer arrives in time, `Cancelled` if either side cancels.
    pub async fn propose(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        manifest: &Manifest,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled("cancelled locally".to_string()));
        }
        info!(
            "Offering {} files ({} bytes) to {}",
            manifest.files.len(),
            manifest.total_size(),
            channel.peer_id()
        );
        send_frame(channel, &Frame::Manifest(manifest.clone())).await?;

        let answer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(ProtocolError::Cancelled("cancelled locally".to_string()))
            }
            answer = timeout(self.config.handshake_timeout, reader.next_frame(channel)) => answer,
        };

        match answer {
            Err(_) => {
                warn!(
                    "{} did not answer the manifest within {:?}",
                    channel.peer_id(),
                    self.config.handshake_timeout
                );
                Err(ProtocolError::HandshakeTimeout)
            }
            Ok(frame) => match frame? {
                Frame::ManifestAccept => {
                    debug!("{} accepted the manifest", channel.peer_id());
                    Ok(())
                }
                Frame::ManifestReject { reason } => Err(ProtocolError::HandshakeRejected(reason)),
                Frame::Cancel => Err(ProtocolError::Cancelled("cancelled by peer".to_string())),
                Frame::Abort { reason } => {
                    Err(ProtocolError::Transport(format!("peer aborted: {}", reason)))
                }
                other => Err(ProtocolError::InvalidPacket(format!(
                    "expected manifest answer, got {}",
                    other.kind_name()
                ))),
            },
        }
    }

    /// Read the manifest an initiator opens a channel with
    pub async fn read_offer(
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        handshake_timeout: Duration,
    ) -> Result<Manifest> {
        let frame = timeout(handshake_timeout, reader.next_frame(channel))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!(
                    "no manifest from {} within {:?}",
                    channel.peer_id(),
                    handshake_timeout
                ))
            })??;

        match frame {
            Frame::Manifest(manifest) => Ok(manifest),
            other => Err(ProtocolError::InvalidPacket(format!(
                "expected manifest, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Hold an offer until a decision arrives, it expires, or the initiator leaves
    ///
    /// The decision receiver is borrowed so the caller can close it and
    /// pick up a decision that raced with expiry.
    pub async fn hold_offer<T>(
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        decision: &mut oneshot::Receiver<T>,
        expires_in: Duration,
    ) -> OfferOutcome<T> {
        let expiry = sleep(expires_in);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                decided = &mut *decision => {
                    return match decided {
                        Ok(value) => OfferOutcome::Decided(value),
                        Err(_) => OfferOutcome::Abandoned,
                    };
                }
                _ = &mut expiry => return OfferOutcome::Expired,
                frame = reader.next_frame(channel) => match frame {
                    Ok(Frame::Cancel) => {
                        return OfferOutcome::Withdrawn("cancelled by peer".to_string())
                    }
                    Ok(Frame::Abort { reason }) => return OfferOutcome::Withdrawn(reason),
                    Ok(other) => {
                        warn!(
                            "Ignoring {} frame from {} while the offer is pending",
                            other.kind_name(),
                            channel.peer_id()
                        );
                    }
                    Err(e) => return OfferOutcome::Withdrawn(e.to_string()),
                },
            }
        }
    }

    /// Accept the manifest
    pub async fn acknowledge(&self, channel: &mut dyn DuplexChannel) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled("cancelled locally".to_string()));
        }
        send_frame(channel, &Frame::ManifestAccept).await
    }

    /// Decline the manifest
    pub async fn reject(channel: &mut dyn DuplexChannel, reason: &str) -> Result<()> {
        info!("Rejecting offer from {}: {}", channel.peer_id(), reason);
        send_frame(
            channel,
            &Frame::ManifestReject {
                reason: reason.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{StreamChannel, TransportType};

    fn pipe() -> (
        StreamChannel<tokio::io::DuplexStream>,
        StreamChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (
            StreamChannel::new(a, "responder", TransportType::Memory),
            StreamChannel::new(b, "initiator", TransportType::Memory),
        )
    }

    fn manifest() -> Manifest {
        let files = vec![
            FileDescriptor::new(FileHandle::new("/tmp/a.txt"), "a.txt", 3_000_000),
            FileDescriptor::new(FileHandle::new("/tmp/b.txt"), "b.txt", 2_000_000),
        ];
        manifest_for(
            &LocalIdentity::with_id("laptop", "Laptop"),
            SessionId::new(),
            &files,
        )
    }

    fn negotiator(handshake_timeout: Duration) -> SessionNegotiator {
        SessionNegotiator::new(
            TransferConfig {
                handshake_timeout,
                ..TransferConfig::default()
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_slot_rejects_second_reservation() {
        let slot = SessionSlot::new();
        let first = SessionId::new();
        let guard = slot
            .try_reserve("phone", first, CancellationToken::new())
            .unwrap();

        assert!(matches!(
            slot.try_reserve("phone", SessionId::new(), CancellationToken::new()),
            Err(ProtocolError::SessionBusy(peer)) if peer == "phone"
        ));
        assert!(matches!(
            slot.try_reserve("tablet", SessionId::new(), CancellationToken::new()),
            Err(ProtocolError::TransferInProgress(peer)) if peer == "phone"
        ));
        assert_eq!(slot.active_peer().as_deref(), Some("phone"));

        drop(guard);
        assert!(slot.is_free());
        assert!(slot
            .try_reserve("tablet", SessionId::new(), CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn test_slot_cancel_targets_holder_only() {
        let slot = SessionSlot::new();
        let token = CancellationToken::new();
        let id = SessionId::new();
        let _guard = slot.try_reserve("phone", id, token.clone()).unwrap();

        assert!(!slot.cancel(SessionId::new()));
        assert!(!token.is_cancelled());
        assert!(slot.cancel(id));
        assert!(token.is_cancelled());
        // cancelling twice is harmless
        assert!(slot.cancel(id));
    }

    #[test]
    fn test_received_names_are_sanitised() {
        let mut offer = manifest();
        offer.files[0].name = "../../etc/passwd".to_string();
        let files = files_from_manifest(&offer);
        assert_eq!(files[0].name, "passwd");
        assert_eq!(files[1].byte_size, 2_000_000);
    }

    #[tokio::test]
    async fn test_accepted_handshake() {
        let (mut responder, mut initiator) = pipe();
        let offer = manifest();

        let respond = tokio::spawn(async move {
            let mut reader = FrameReader::new();
            let received =
                SessionNegotiator::read_offer(&mut responder, &mut reader, Duration::from_secs(1))
                    .await
                    .unwrap();
            negotiator(Duration::from_secs(1))
                .acknowledge(&mut responder)
                .await
                .unwrap();
            received
        });

        let mut reader = FrameReader::new();
        negotiator(Duration::from_secs(1))
            .propose(&mut initiator, &mut reader, &offer)
            .await
            .unwrap();
        assert_eq!(respond.await.unwrap(), offer);
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (mut responder, mut initiator) = pipe();
        let offer = manifest();

        tokio::spawn(async move {
            let mut reader = FrameReader::new();
            SessionNegotiator::read_offer(&mut responder, &mut reader, Duration::from_secs(1))
                .await
                .unwrap();
            SessionNegotiator::reject(&mut responder, BUSY_REJECT_REASON)
                .await
                .unwrap();
            responder
        });

        let mut reader = FrameReader::new();
        let result = negotiator(Duration::from_secs(1))
            .propose(&mut initiator, &mut reader, &offer)
            .await;
        assert!(matches!(result, Err(ProtocolError::HandshakeRejected(r)) if r == "busy"));
    }

    #[tokio::test]
    async fn test_silent_responder_times_out() {
        let (_responder, mut initiator) = pipe();
        let mut reader = FrameReader::new();
        let result = negotiator(Duration::from_millis(50))
            .propose(&mut initiator, &mut reader, &manifest())
            .await;
        assert!(matches!(result, Err(ProtocolError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let (_responder, mut initiator) = pipe();
        let cancel = CancellationToken::new();
        let negotiator = SessionNegotiator::new(TransferConfig::default(), cancel.clone());

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut reader = FrameReader::new();
        let result = negotiator
            .propose(&mut initiator, &mut reader, &manifest())
            .await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_hold_offer_outcomes() {
        // decided
        let (mut responder, _initiator) = pipe();
        let (tx, mut rx) = oneshot::channel();
        tx.send(7u32).unwrap();
        let outcome = SessionNegotiator::hold_offer(
            &mut responder,
            &mut FrameReader::new(),
            &mut rx,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(outcome, OfferOutcome::Decided(7)));

        // expired
        let (mut responder, _initiator) = pipe();
        let (_tx, mut rx) = oneshot::channel::<u32>();
        let outcome = SessionNegotiator::hold_offer(
            &mut responder,
            &mut FrameReader::new(),
            &mut rx,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(outcome, OfferOutcome::Expired));

        // withdrawn
        let (mut responder, mut initiator) = pipe();
        send_frame(&mut initiator, &Frame::Cancel).await.unwrap();
        let (_tx, mut rx) = oneshot::channel::<u32>();
        let outcome = SessionNegotiator::hold_offer(
            &mut responder,
            &mut FrameReader::new(),
            &mut rx,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(outcome, OfferOutcome::Withdrawn(_)));

        // abandoned
        let (mut responder, _initiator) = pipe();
        let (tx, mut rx) = oneshot::channel::<u32>();
        drop(tx);
        let outcome = SessionNegotiator::hold_offer(
            &mut responder,
            &mut FrameReader::new(),
            &mut rx,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(outcome, OfferOutcome::Abandoned));
    }
}

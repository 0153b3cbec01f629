//! Transfer Controller
//!
//! The engine facade handed to the UI layer. A `TransferController` is
//! constructed explicitly, started, and shut down by its owner; there is no
//! global instance.
//!
//! ## Tasks
//!
//! - discovery runs inside the [`DeviceRegistry`]
//! - the inbound listener accepts channels and spawns one handler per channel
//! - each session runs in its own task, at most one at a time engine-wide
//!
//! The UI never waits on transport I/O. It reads state from watch channels
//! (peers, current session, pending offers, history) and issues commands
//! that return as soon as the work is handed to a task.

use crate::config::EngineConfig;
use crate::device::{LocalIdentity, PeerDevice};
use crate::discovery::{DeviceRegistry, PeerStream};
use crate::history::{HistoryLedger, HistoryRecord};
use crate::negotiator::{
    files_from_manifest, manifest_for, OfferOutcome, SessionNegotiator, SessionSlot, SlotGuard,
    BUSY_REJECT_REASON, OFFER_GRACE,
};
use crate::pipeline::ChunkPipeline;
use crate::progress::SessionPublisher;
use crate::recovery::Backoff;
use crate::session::{FileDescriptor, FileHandle, Role, SessionId, SessionStatus, TransferSession};
use crate::storage::FileStorage;
use crate::transport::{DuplexChannel, TransportAdapter};
use crate::wire::{send_frame, Frame, FrameReader};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for the goodbye frame sent when a session ends early
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Reject reasons sent to initiators
const EXPIRED_REJECT_REASON: &str = "timeout";
const UNAVAILABLE_REJECT_REASON: &str = "unavailable";
const DECLINED_REJECT_REASON: &str = "declined";

/// An unsolicited manifest waiting for a local decision
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingOffer {
    /// Identifier the session will carry if accepted
    pub session_id: SessionId,
    pub peer: PeerDevice,
    pub files: Vec<FileDescriptor>,
    pub total_bytes: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
struct AcceptedOffer {
    session: TransferSession,
    guard: SlotGuard,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum OfferDecision {
    Accept(AcceptedOffer),
    Reject(String),
}

#[derive(Debug)]
struct PendingOffer {
    offer: IncomingOffer,
    decision: oneshot::Sender<OfferDecision>,
}

#[derive(Debug)]
struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Engine {
    config: EngineConfig,
    identity: LocalIdentity,
    transport: Arc<dyn TransportAdapter>,
    storage: Arc<dyn FileStorage>,
    registry: DeviceRegistry,
    ledger: Arc<HistoryLedger>,
    slot: SessionSlot,
    session: watch::Sender<Option<TransferSession>>,
    selection: Mutex<Vec<FileDescriptor>>,
    pending: Mutex<VecDeque<PendingOffer>>,
    offers: watch::Sender<Vec<IncomingOffer>>,
    listener: Mutex<Option<Listener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Engine facade coordinating discovery, negotiation, transfer and history
#[derive(Debug, Clone)]
pub struct TransferController {
    engine: Arc<Engine>,
}

impl TransferController {
    /// Build an engine with an in-memory history ledger
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        identity: LocalIdentity,
        transport: Arc<dyn TransportAdapter>,
        storage: Arc<dyn FileStorage>,
    ) -> Result<Self> {
        Self::with_ledger(
            config,
            identity,
            transport,
            storage,
            Arc::new(HistoryLedger::new()),
        )
    }

    /// Build an engine that records into an existing ledger
    pub fn with_ledger(
        config: EngineConfig,
        identity: LocalIdentity,
        transport: Arc<dyn TransportAdapter>,
        storage: Arc<dyn FileStorage>,
        ledger: Arc<HistoryLedger>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = DeviceRegistry::new(
            Arc::clone(&transport),
            identity.clone(),
            config.discovery.clone(),
            config.proximity,
        );
        let (session, _) = watch::channel(None);
        let (offers, _) = watch::channel(Vec::new());

        Ok(Self {
            engine: Arc::new(Engine {
                config,
                identity,
                transport,
                storage,
                registry,
                ledger,
                slot: SessionSlot::new(),
                session,
                selection: Mutex::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                offers,
                listener: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.engine.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    /// Start discovery and the inbound listener; idempotent
    pub async fn start(&self) {
        self.engine.registry.start_discovery().await;

        let mut listener = self.engine.listener.lock().await;
        if listener.is_some() {
            debug!("Inbound listener already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_listener(Arc::clone(&self.engine), cancel.clone()));
        *listener = Some(Listener { cancel, task });
        info!(
            "Transfer engine started as {} ({}) on {}",
            self.engine.identity.display_name,
            self.engine.identity.device_id,
            self.engine.transport.transport_type()
        );
    }

    /// Cancel the active session, drop pending offers and stop all tasks
    ///
    /// Returns once the active session has reached a terminal state and
    /// been recorded.
    pub async fn shutdown(&self) {
        info!("Shutting down transfer engine");

        if let Some(listener) = self.engine.listener.lock().await.take() {
            listener.cancel.cancel();
            if let Err(e) = listener.task.await {
                warn!("Inbound listener ended abnormally: {}", e);
            }
        }

        if let Some(session_id) = self.engine.slot.cancel_active() {
            info!("Cancelling active session {}", session_id);
        }

        {
            let mut pending = self.engine.pending.lock().await;
            pending.clear();
            self.engine.publish_offers(&pending);
        }

        let tasks = std::mem::take(&mut *self.engine.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        self.engine.registry.stop_discovery().await;
    }

    /// Choose the files the next `send_to` offers
    ///
    /// # Errors
    ///
    /// `NoFilesSelected` for an empty selection, or the storage error for
    /// the first handle that cannot be resolved. The previous selection is
    /// kept on error.
    pub async fn select_files(&self, handles: Vec<FileHandle>) -> Result<Vec<FileDescriptor>> {
        if handles.is_empty() {
            return Err(ProtocolError::NoFilesSelected);
        }

        let mut files = Vec::with_capacity(handles.len());
        for handle in handles {
            let stat = self.engine.storage.stat(&handle).await?;
            files.push(FileDescriptor::new(handle, stat.name, stat.size));
        }

        debug!(
            "Selected {} files ({} bytes)",
            files.len(),
            files.iter().map(|f| f.byte_size).sum::<u64>()
        );
        *self.engine.selection.lock().await = files.clone();
        Ok(files)
    }

    /// Start sending the selected files to `peer`
    ///
    /// Returns as soon as the session exists; progress is observed through
    /// [`watch_session`](Self::watch_session).
    ///
    /// # Errors
    ///
    /// `NoFilesSelected`, `SessionBusy` if a session with `peer` is active,
    /// `TransferInProgress` if another peer's session is. A busy engine is
    /// left untouched.
    pub async fn send_to(&self, peer: &PeerDevice) -> Result<SessionId> {
        let files = self.engine.selection.lock().await.clone();
        if files.is_empty() {
            return Err(ProtocolError::NoFilesSelected);
        }

        let session_id = SessionId::new();
        let cancel = CancellationToken::new();
        let guard = self.engine.slot.try_reserve(&peer.id, session_id, cancel.clone())?;

        info!(
            "Sending {} files to {} ({}), session {}",
            files.len(),
            peer.display_name,
            peer.id,
            session_id
        );
        let session = TransferSession::new(session_id, Role::Sender, peer.clone(), files);
        let publisher = SessionPublisher::new(
            session,
            self.engine.config.progress.clone(),
            self.engine.session.clone(),
        );

        let task = tokio::spawn(run_sender(
            Arc::clone(&self.engine),
            publisher,
            guard,
            cancel,
        ));
        self.engine.track(task).await;
        Ok(session_id)
    }

    /// Accept the oldest pending offer
    ///
    /// # Errors
    ///
    /// `NoPendingOffer` if nothing is waiting (or the offer expired in the
    /// meantime). `SessionBusy` / `TransferInProgress` if a session is
    /// already active; the offer then stays pending.
    pub async fn accept_incoming(&self) -> Result<SessionId> {
        let mut pending = self.engine.pending.lock().await;
        let offer = match pending.front() {
            Some(entry) => entry.offer.clone(),
            None => return Err(ProtocolError::NoPendingOffer),
        };

        let accepted = self.engine.reserve_receiver(&offer)?;
        let entry = pending.pop_front().ok_or(ProtocolError::NoPendingOffer)?;
        self.engine.publish_offers(&pending);
        drop(pending);

        if entry
            .decision
            .send(OfferDecision::Accept(accepted))
            .is_err()
        {
            debug!("Offer {} ended before it was accepted", offer.session_id);
            return Err(ProtocolError::NoPendingOffer);
        }

        info!(
            "Accepted {} files from {}, session {}",
            offer.files.len(),
            offer.peer.display_name,
            offer.session_id
        );
        Ok(offer.session_id)
    }

    /// Reject the oldest pending offer
    pub async fn reject_incoming(&self, reason: Option<&str>) -> Result<SessionId> {
        let mut pending = self.engine.pending.lock().await;
        let entry = pending.pop_front().ok_or(ProtocolError::NoPendingOffer)?;
        self.engine.publish_offers(&pending);
        drop(pending);

        let reason = reason.unwrap_or(DECLINED_REJECT_REASON).to_string();
        let session_id = entry.offer.session_id;
        if entry.decision.send(OfferDecision::Reject(reason)).is_err() {
            debug!("Offer {} ended before it was rejected", session_id);
        }
        Ok(session_id)
    }

    /// Cancel a session or pending offer
    ///
    /// Idempotent. Unknown and already finished sessions are ignored.
    pub async fn cancel(&self, session_id: SessionId) {
        if self.engine.slot.cancel(session_id) {
            info!("Cancelling session {}", session_id);
            return;
        }

        let mut pending = self.engine.pending.lock().await;
        if let Some(index) = pending
            .iter()
            .position(|entry| entry.offer.session_id == session_id)
        {
            if let Some(entry) = pending.remove(index) {
                self.engine.publish_offers(&pending);
                info!("Cancelling pending offer {}", session_id);
                let decision = OfferDecision::Reject(DECLINED_REJECT_REASON.to_string());
                if entry.decision.send(decision).is_err() {
                    debug!("Offer {} ended before it was cancelled", session_id);
                }
            }
            return;
        }

        debug!("Ignoring cancel for {}: not active", session_id);
    }

    /// Latest state of the current (or last) session
    pub fn current_session(&self) -> Option<TransferSession> {
        self.engine.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<Option<TransferSession>> {
        self.engine.session.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerDevice> {
        self.engine.registry.peers()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.engine.registry.watch_peers()
    }

    /// Peer sets of the current discovery run
    pub async fn observe_peers(&self) -> PeerStream {
        self.engine.registry.observe_peers().await
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.engine.registry
    }

    pub fn pending_offers(&self) -> Vec<IncomingOffer> {
        self.engine.offers.borrow().clone()
    }

    pub fn watch_offers(&self) -> watch::Receiver<Vec<IncomingOffer>> {
        self.engine.offers.subscribe()
    }

    /// Finished sessions, newest first
    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.engine.ledger.list_history().await
    }

    pub fn watch_history(&self) -> watch::Receiver<Vec<HistoryRecord>> {
        self.engine.ledger.subscribe()
    }

    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.engine.ledger
    }
}

impl Engine {
    fn pipeline(&self, cancel: &CancellationToken) -> ChunkPipeline {
        ChunkPipeline::new(
            self.config.transfer.clone(),
            Arc::clone(&self.storage),
            cancel.clone(),
        )
    }

    fn negotiator(&self, cancel: &CancellationToken) -> SessionNegotiator {
        SessionNegotiator::new(self.config.transfer.clone(), cancel.clone())
    }

    async fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn publish_offers(&self, pending: &VecDeque<PendingOffer>) {
        self.offers
            .send_replace(pending.iter().map(|entry| entry.offer.clone()).collect());
    }

    /// Claim the slot for an incoming offer; the session starts at `Handshaking`
    fn reserve_receiver(&self, offer: &IncomingOffer) -> Result<AcceptedOffer> {
        let cancel = CancellationToken::new();
        let guard = self
            .slot
            .try_reserve(&offer.peer.id, offer.session_id, cancel.clone())?;

        let mut session = TransferSession::new(
            offer.session_id,
            Role::Receiver,
            offer.peer.clone(),
            offer.files.clone(),
        );
        session.started_at = offer.received_at;
        session.advance(SessionStatus::Handshaking)?;

        Ok(AcceptedOffer {
            session,
            guard,
            cancel,
        })
    }

    /// Publish the outcome of a session, free the slot and record it
    async fn finish_session(
        &self,
        mut publisher: SessionPublisher,
        guard: SlotGuard,
        channel: Option<Box<dyn DuplexChannel>>,
        cancel: &CancellationToken,
        result: Result<()>,
    ) {
        let session_id = publisher.session().session_id;
        let mut channel = channel;

        if let Err(error) = result {
            let cancelled_locally = cancel.is_cancelled();

            if let (Some(channel), Some(frame)) =
                (channel.as_mut(), farewell(&error, cancelled_locally))
            {
                match timeout(FAREWELL_TIMEOUT, send_frame(&mut **channel, &frame)).await {
                    Ok(Err(e)) => debug!("Could not notify peer of {}: {}", session_id, e),
                    Err(_) => debug!("Peer of {} stopped reading", session_id),
                    Ok(Ok(())) => {}
                }
            }

            let outcome = if cancelled_locally || matches!(error, ProtocolError::Cancelled(_)) {
                info!("Session {} cancelled: {}", session_id, error);
                publisher.advance(SessionStatus::Cancelled)
            } else {
                warn!("Session {} failed: {}", session_id, error);
                publisher.fail(error.failure_kind())
            };
            if let Err(e) = outcome {
                error!("Session {} could not end cleanly: {}", session_id, e);
            }
        }

        if let Some(mut channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Closing channel of {}: {}", session_id, e);
            }
        }
        drop(guard);

        if let Err(e) = self.ledger.record_completion(publisher.session()).await {
            error!("Failed to record session {}: {}", session_id, e);
        }
    }
}

/// Frame telling the peer why the session ended, when it does not know yet
fn farewell(error: &ProtocolError, cancelled_locally: bool) -> Option<Frame> {
    if cancelled_locally {
        return Some(Frame::Cancel);
    }
    match error {
        // the responder is still holding the offer
        ProtocolError::HandshakeTimeout => Some(Frame::Cancel),
        ProtocolError::Cancelled(_)
        | ProtocolError::HandshakeRejected(_)
        | ProtocolError::Integrity { .. }
        | ProtocolError::Transport(_) => None,
        other => Some(Frame::Abort {
            reason: other.to_string(),
        }),
    }
}

async fn run_sender(
    engine: Arc<Engine>,
    mut publisher: SessionPublisher,
    guard: SlotGuard,
    cancel: CancellationToken,
) {
    let mut channel = None;
    let result = drive_sender(&engine, &mut publisher, &mut channel, &cancel).await;
    engine
        .finish_session(publisher, guard, channel, &cancel, result)
        .await;
}

async fn drive_sender(
    engine: &Engine,
    publisher: &mut SessionPublisher,
    slot: &mut Option<Box<dyn DuplexChannel>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let peer_id = publisher.session().peer.id.clone();

    if engine.registry.is_running().await && !engine.registry.peers().iter().any(|p| p.id == peer_id) {
        publisher.advance(SessionStatus::Discovering)?;
        wait_for_peer(engine, &peer_id, cancel).await?;
    }

    publisher.advance(SessionStatus::Connecting)?;
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(ProtocolError::Cancelled("cancelled locally".to_string()))
        }
        opened = engine.transport.connect(&peer_id) => opened?,
    };
    let channel: &mut dyn DuplexChannel = &mut **slot.insert(opened);
    publisher.advance(SessionStatus::Handshaking)?;

    let session = publisher.session();
    let manifest = manifest_for(&engine.identity, session.session_id, &session.files);
    let files = session.files.clone();
    let mut reader = FrameReader::new();
    engine
        .negotiator(cancel)
        .propose(channel, &mut reader, &manifest)
        .await?;
    publisher.advance(SessionStatus::Ready)?;

    publisher.advance(SessionStatus::Transferring)?;
    engine
        .pipeline(cancel)
        .send(channel, &mut reader, &files, &mut *publisher)
        .await?;
    publisher.advance(SessionStatus::Completed)
}

/// Wait until discovery hears `peer_id`, at most one liveness window
async fn wait_for_peer(engine: &Engine, peer_id: &str, cancel: &CancellationToken) -> Result<()> {
    let mut peers = engine.registry.watch_peers();
    let heard = async {
        loop {
            if peers.borrow_and_update().iter().any(|p| p.id == peer_id) {
                return true;
            }
            if peers.changed().await.is_err() {
                return false;
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled("cancelled locally".to_string())),
        heard = timeout(engine.config.discovery.peer_timeout, heard) => match heard {
            Ok(true) => Ok(()),
            _ => Err(ProtocolError::DeviceNotFound(peer_id.to_string())),
        },
    }
}

async fn run_listener(engine: Arc<Engine>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(
        engine.config.discovery.backoff_initial,
        engine.config.discovery.backoff_max,
    );

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = engine.transport.accept() => accepted,
        };

        match accepted {
            Ok(channel) => {
                backoff.reset();
                debug!("Inbound channel from {}", channel.peer_id());
                let task = tokio::spawn(handle_inbound(
                    Arc::clone(&engine),
                    channel,
                    cancel.clone(),
                ));
                engine.track(task).await;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Accepting inbound channel failed: {} ({})", e, backoff.status());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    debug!("Inbound listener stopped");
}

async fn handle_inbound(
    engine: Arc<Engine>,
    mut channel: Box<dyn DuplexChannel>,
    listener: CancellationToken,
) {
    let handshake_timeout = engine.config.transfer.handshake_timeout;
    let mut reader = FrameReader::new();

    let manifest =
        match SessionNegotiator::read_offer(channel.as_mut(), &mut reader, handshake_timeout).await
        {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Dropping inbound channel from {}: {}", channel.peer_id(), e);
                close_quietly(channel.as_mut()).await;
                return;
            }
        };

    let peer = engine
        .registry
        .resolve_peer(&manifest.sender_id, &manifest.sender_name);
    let offer = IncomingOffer {
        session_id: manifest.session_id,
        files: files_from_manifest(&manifest),
        total_bytes: manifest.total_size(),
        peer,
        received_at: Utc::now(),
    };
    info!(
        "Incoming offer {} from {}: {} files, {} bytes",
        offer.session_id,
        offer.peer.display_name,
        offer.files.len(),
        offer.total_bytes
    );

    if listener.is_cancelled() {
        reply_and_close(channel, UNAVAILABLE_REJECT_REASON).await;
        return;
    }

    if engine.config.transfer.auto_accept {
        match engine.reserve_receiver(&offer) {
            Ok(accepted) => run_receiver(engine, accepted, channel, reader).await,
            Err(e) => {
                debug!("Auto-accept refused: {}", e);
                reply_and_close(channel, BUSY_REJECT_REASON).await;
            }
        }
        return;
    }

    if let Some(active) = engine.slot.active_peer() {
        debug!("Refusing offer {}: session with {} active", offer.session_id, active);
        reply_and_close(channel, BUSY_REJECT_REASON).await;
        return;
    }

    let session_id = offer.session_id;
    let (decision_tx, mut decision_rx) = oneshot::channel();
    {
        let mut pending = engine.pending.lock().await;
        pending.push_back(PendingOffer {
            offer,
            decision: decision_tx,
        });
        engine.publish_offers(&pending);
    }

    let outcome = SessionNegotiator::hold_offer(
        channel.as_mut(),
        &mut reader,
        &mut decision_rx,
        handshake_timeout + OFFER_GRACE,
    )
    .await;

    let (reply, error) = match outcome {
        OfferOutcome::Decided(OfferDecision::Accept(accepted)) => {
            run_receiver(engine, accepted, channel, reader).await;
            return;
        }
        OfferOutcome::Decided(OfferDecision::Reject(reason)) => {
            reply_and_close(channel, &reason).await;
            return;
        }
        OfferOutcome::Expired => {
            info!("Offer {} expired without a decision", session_id);
            (Some(EXPIRED_REJECT_REASON), ProtocolError::HandshakeTimeout)
        }
        OfferOutcome::Withdrawn(reason) => {
            info!("Offer {} withdrawn: {}", session_id, reason);
            (None, ProtocolError::Cancelled(format!("offer withdrawn: {}", reason)))
        }
        OfferOutcome::Abandoned => (
            Some(UNAVAILABLE_REJECT_REASON),
            ProtocolError::Cancelled("engine shut down".to_string()),
        ),
    };

    {
        let mut pending = engine.pending.lock().await;
        pending.retain(|entry| entry.offer.session_id != session_id);
        engine.publish_offers(&pending);
    }

    // An accept may have raced with the offer ending
    decision_rx.close();
    if let Ok(OfferDecision::Accept(accepted)) = decision_rx.try_recv() {
        let AcceptedOffer {
            session,
            guard,
            cancel,
        } = accepted;
        let publisher = SessionPublisher::new(
            session,
            engine.config.progress.clone(),
            engine.session.clone(),
        );
        engine
            .finish_session(publisher, guard, None, &cancel, Err(error))
            .await;
    }

    match reply {
        Some(reason) => reply_and_close(channel, reason).await,
        None => close_quietly(channel.as_mut()).await,
    }
}

async fn run_receiver(
    engine: Arc<Engine>,
    accepted: AcceptedOffer,
    mut channel: Box<dyn DuplexChannel>,
    mut reader: FrameReader,
) {
    let AcceptedOffer {
        session,
        guard,
        cancel,
    } = accepted;
    let mut publisher = SessionPublisher::new(
        session,
        engine.config.progress.clone(),
        engine.session.clone(),
    );

    let result = drive_receiver(
        &engine,
        &mut publisher,
        channel.as_mut(),
        &mut reader,
        &cancel,
    )
    .await;
    engine
        .finish_session(publisher, guard, Some(channel), &cancel, result)
        .await;
}

async fn drive_receiver(
    engine: &Engine,
    publisher: &mut SessionPublisher,
    channel: &mut dyn DuplexChannel,
    reader: &mut FrameReader,
    cancel: &CancellationToken,
) -> Result<()> {
    engine.negotiator(cancel).acknowledge(channel).await?;
    publisher.advance(SessionStatus::Ready)?;

    let files = publisher.session().files.clone();
    publisher.advance(SessionStatus::Transferring)?;
    let saved = engine
        .pipeline(cancel)
        .receive(channel, reader, &files, &mut *publisher)
        .await?;
    debug!(
        "Session {} saved {} files",
        publisher.session().session_id,
        saved.len()
    );
    publisher.advance(SessionStatus::Completed)
}

async fn reply_and_close(mut channel: Box<dyn DuplexChannel>, reason: &str) {
    if let Err(e) = SessionNegotiator::reject(channel.as_mut(), reason).await {
        debug!("Could not send reject to {}: {}", channel.peer_id(), e);
    }
    close_quietly(channel.as_mut()).await;
}

async fn close_quietly(channel: &mut dyn DuplexChannel) {
    if let Err(e) = channel.close().await {
        debug!("Closing channel to {}: {}", channel.peer_id(), e);
    }
}

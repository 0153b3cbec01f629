mod config;
mod diagnostics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use diagnostics::{Cli, Command};
use nearby_share_protocol::{
    DiscoveryEvent, FileHandle, FsStorage, HistoryLedger, IncomingOffer, LanTransport,
    LocalIdentity, SessionId, SessionStatus, TransferController, TransferSession,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use config::Config;

/// Main daemon state
struct Daemon {
    config: Config,

    /// Transfer engine bound to the LAN transport
    controller: TransferController,
}

impl Daemon {
    /// Bind the transport, open the history ledger and build the engine
    async fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create data directories")?;

        let identity = load_identity(&config)?;
        info!(
            "Device: {} ({})",
            identity.display_name, identity.device_id
        );

        let transport = LanTransport::bind(config.lan_config())
            .await
            .context("Failed to bind LAN transport")?;
        let storage = FsStorage::new(config.paths.receive_dir.clone());
        let ledger = HistoryLedger::with_storage(config.history_path())
            .await
            .context("Failed to open transfer history")?;

        let controller = TransferController::with_ledger(
            config.engine_config(),
            identity,
            Arc::new(transport),
            Arc::new(storage),
            Arc::new(ledger),
        )
        .context("Invalid engine configuration")?;

        Ok(Self { config, controller })
    }

    /// Advertise, discover and receive until Ctrl-C
    async fn serve(&self) -> Result<()> {
        info!(
            "Receiving into {} (auto-accept: {})",
            self.config.paths.receive_dir.display(),
            self.config.transfer.auto_accept
        );

        let mut discovery_events = self.controller.registry().subscribe_events();
        let mut sessions = self.controller.watch_session();
        let mut offers = self.controller.watch_offers();

        self.controller.start().await;

        let mut last_status: Option<(SessionId, SessionStatus)> = None;
        let mut announced: HashSet<SessionId> = HashSet::new();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break;
                }
                event = discovery_events.recv() => match event {
                    Ok(event) => handle_discovery_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Missed {} discovery events", skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Discovery event channel closed");
                        break;
                    }
                },
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = sessions.borrow_and_update().clone();
                    if let Some(session) = session {
                        log_session(&session, &mut last_status);
                    }
                }
                changed = offers.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let pending = offers.borrow_and_update().clone();
                    for offer in &pending {
                        if announced.insert(offer.session_id) {
                            log_offer(offer, self.config.transfer.auto_accept);
                        }
                    }
                    announced.retain(|id| pending.iter().any(|o| o.session_id == *id));
                }
            }
        }

        self.controller.shutdown().await;
        Ok(())
    }

    /// Discover for `wait` and print the peer table
    async fn list_peers(&self, wait: Duration) -> Result<()> {
        self.controller.start().await;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {}
        }

        let mut peers = self.controller.peers();
        self.controller.shutdown().await;

        if peers.is_empty() {
            println!("No nearby devices found");
            return Ok(());
        }

        peers.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        println!("{:<36}  {:<24}  {:>3}  PROXIMITY", "ID", "NAME", "SIG");
        for peer in &peers {
            println!("{}", diagnostics::peer_line(peer));
        }
        Ok(())
    }

    /// Send `files` to the peer matching `target` and follow the session
    async fn send(&self, target: &str, wait: Duration, files: &[PathBuf]) -> Result<()> {
        let handles = files
            .iter()
            .map(|path| {
                std::fs::canonicalize(path)
                    .map(FileHandle::from)
                    .with_context(|| format!("Invalid path {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let selected = self
            .controller
            .select_files(handles)
            .await
            .context("Failed to select files")?;
        let total: u64 = selected.iter().map(|f| f.byte_size).sum();
        println!(
            "Sending {} file(s), {}",
            selected.len(),
            diagnostics::format_bytes(total)
        );

        self.controller.start().await;
        let result = self.send_selected(target, wait).await;
        self.controller.shutdown().await;

        let session = result?;
        match session.status {
            SessionStatus::Completed => {
                println!("Transfer complete");
                Ok(())
            }
            SessionStatus::Cancelled => bail!("Transfer cancelled"),
            _ => bail!("Transfer failed: {}", diagnostics::session_line(&session)),
        }
    }

    async fn send_selected(&self, target: &str, wait: Duration) -> Result<TransferSession> {
        let mut peers = self.controller.watch_peers();
        let registry = self.controller.registry();

        let found = tokio::time::timeout(
            wait,
            peers.wait_for(|list| {
                list.iter()
                    .any(|p| p.id == target || p.display_name.eq_ignore_ascii_case(target))
            }),
        )
        .await
        .is_ok_and(|seen| seen.is_ok());
        let peer = if found {
            registry.find_peer(target)
        } else {
            None
        };
        let Some(peer) = peer else {
            bail!("No nearby device matches '{}'", target);
        };

        println!("Sending to {} ({})", peer.display_name, peer.id);
        let mut sessions = self.controller.watch_session();
        let session_id = self
            .controller
            .send_to(&peer)
            .await
            .context("Failed to start transfer")?;

        let mut cancelled = false;
        loop {
            let snapshot = sessions
                .borrow_and_update()
                .clone()
                .filter(|s| s.session_id == session_id);
            if let Some(session) = snapshot {
                println!("{}", diagnostics::session_line(&session));
                if session.is_terminal() {
                    return Ok(session);
                }
            }

            tokio::select! {
                changed = sessions.changed() => {
                    if changed.is_err() {
                        bail!("Transfer engine stopped");
                    }
                }
                _ = tokio::signal::ctrl_c(), if !cancelled => {
                    info!("Cancelling transfer {}", session_id);
                    self.controller.cancel(session_id).await;
                    cancelled = true;
                }
            }
        }
    }
}

/// Resolve the device identity, generating and saving an ID on first run
fn load_identity(config: &Config) -> Result<LocalIdentity> {
    match config.load_device_id() {
        Some(device_id) => Ok(LocalIdentity::with_id(device_id, config.device.name.clone())),
        None => {
            let identity = LocalIdentity::new(config.device.name.clone());
            config
                .save_device_id(&identity.device_id)
                .context("Failed to persist device ID")?;
            Ok(identity)
        }
    }
}

fn handle_discovery_event(event: DiscoveryEvent) {
    match event {
        DiscoveryEvent::Started => info!("Discovery started"),
        DiscoveryEvent::PeerDiscovered(peer) => info!(
            "Discovered {} ({}), {} signal {}",
            peer.display_name,
            peer.id,
            peer.proximity_bucket.as_str(),
            peer.signal_strength
        ),
        DiscoveryEvent::PeerUpdated(peer) => debug!(
            "Updated {} ({}), {} signal {}",
            peer.display_name,
            peer.id,
            peer.proximity_bucket.as_str(),
            peer.signal_strength
        ),
        DiscoveryEvent::PeerLost { peer_id } => info!("Lost {}", peer_id),
        DiscoveryEvent::ScanFailed { message, retry_in } => {
            warn!("Discovery scan failed: {} (retrying in {:?})", message, retry_in)
        }
        DiscoveryEvent::Stopped => info!("Discovery stopped"),
    }
}

fn log_session(session: &TransferSession, last: &mut Option<(SessionId, SessionStatus)>) {
    let key = (session.session_id, session.status);
    if last.as_ref() == Some(&key) {
        debug!("{} {}", session.session_id, diagnostics::session_line(session));
        return;
    }
    *last = Some(key);

    if session.status == SessionStatus::Failed {
        error!(
            "{:?} session {} with {}: {}",
            session.role,
            session.session_id,
            session.peer.display_name,
            diagnostics::session_line(session)
        );
    } else {
        info!(
            "{:?} session {} with {}: {}",
            session.role,
            session.session_id,
            session.peer.display_name,
            diagnostics::session_line(session)
        );
    }
}

fn log_offer(offer: &IncomingOffer, auto_accept: bool) {
    let names: Vec<&str> = offer.files.iter().map(|f| f.name.as_str()).collect();
    info!(
        "Offer {} from {}: {} ({})",
        offer.session_id,
        offer.peer.display_name,
        names.join(", "),
        diagnostics::format_bytes(offer.total_bytes)
    );
    if !auto_accept {
        info!("Offer will expire unanswered; run with --auto-accept to receive");
    }
}

fn print_history(records: &[nearby_share_protocol::HistoryRecord], limit: Option<usize>) {
    if records.is_empty() {
        println!("No transfers yet");
        return;
    }
    for record in records.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{}", diagnostics::history_line(record));
    }
}

async fn show_history(config: &Config, limit: Option<usize>) -> Result<()> {
    let ledger = HistoryLedger::with_storage(config.history_path())
        .await
        .context("Failed to open transfer history")?;
    print_history(&ledger.list_history().await, limit);
    Ok(())
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config::default_config_path)
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path).context("Failed to load configuration")?;
    debug!("Configuration loaded from {}", path.display());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let mut config = load_config(&config_path(&cli))?;

    match cli.command {
        None => {
            let daemon = Daemon::new(config)
                .await
                .context("Failed to create daemon")?;
            daemon.serve().await
        }
        Some(Command::Serve { auto_accept }) => {
            config.transfer.auto_accept |= auto_accept;
            let daemon = Daemon::new(config)
                .await
                .context("Failed to create daemon")?;
            daemon.serve().await
        }
        Some(Command::Peers { wait }) => {
            let daemon = Daemon::new(config)
                .await
                .context("Failed to create daemon")?;
            daemon.list_peers(Duration::from_secs(wait)).await
        }
        Some(Command::Send { peer, wait, files }) => {
            let daemon = Daemon::new(config)
                .await
                .context("Failed to create daemon")?;
            daemon
                .send(&peer, Duration::from_secs(wait), &files)
                .await
        }
        Some(Command::History { limit }) => show_history(&config, limit).await,
        Some(Command::DumpConfig) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

//! Device Registry
//!
//! Owns the discovery task and publishes the peer set it maintains.

use super::events::DiscoveryEvent;
use crate::config::DiscoveryConfig;
use crate::device::{LocalIdentity, PeerAdvertisement, PeerDevice, ProximityPolicy};
use crate::recovery::Backoff;
use crate::transport::{AdvertisementStream, TransportAdapter};
use crate::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lazy sequence of peer sets
pub type PeerStream = BoxStream<'static, Vec<PeerDevice>>;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct RunningDiscovery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// Peer set of this run; closes when the run ends
    run_peers: watch::Receiver<Vec<PeerDevice>>,
}

/// Live, deduplicated view of reachable peers
#[derive(Debug)]
pub struct DeviceRegistry {
    transport: Arc<dyn TransportAdapter>,
    identity: LocalIdentity,
    config: DiscoveryConfig,
    policy: ProximityPolicy,
    peers: watch::Sender<Vec<PeerDevice>>,
    events: broadcast::Sender<DiscoveryEvent>,
    running: Mutex<Option<RunningDiscovery>>,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        identity: LocalIdentity,
        config: DiscoveryConfig,
        policy: ProximityPolicy,
    ) -> Self {
        let (peers, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            identity,
            config,
            policy,
            peers,
            events,
            running: Mutex::new(None),
        }
    }

    /// Begin advertising and scanning
    ///
    /// Idempotent: calling it while discovery runs does nothing. Scan
    /// failures are retried in the background and never reported here.
    pub async fn start_discovery(&self) {
        let mut running = self.running.lock().await;
        if let Some(run) = running.as_ref() {
            if !run.task.is_finished() {
                debug!("Discovery already running");
                return;
            }
        }

        info!(
            "Starting discovery as {} ({})",
            self.identity.display_name, self.identity.device_id
        );

        let cancel = CancellationToken::new();
        let (run_tx, run_rx) = watch::channel(Vec::new());
        let task = DiscoveryTask {
            transport: self.transport.clone(),
            identity: self.identity.clone(),
            config: self.config.clone(),
            policy: self.policy,
            peers: self.peers.clone(),
            run_peers: run_tx,
            events: self.events.clone(),
            known: HashMap::new(),
        };
        let handle = tokio::spawn(task.run(cancel.clone()));

        let _ = self.events.send(DiscoveryEvent::Started);
        *running = Some(RunningDiscovery {
            cancel,
            task: handle,
            run_peers: run_rx,
        });
    }

    /// Halt advertising and scanning; safe to call when not running
    pub async fn stop_discovery(&self) {
        let run = match self.running.lock().await.take() {
            Some(run) => run,
            None => return,
        };

        info!("Stopping discovery");
        run.cancel.cancel();
        if let Err(e) = run.task.await {
            warn!("Discovery task ended abnormally: {}", e);
        }

        self.peers.send_replace(Vec::new());
        let _ = self.events.send(DiscoveryEvent::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|run| !run.task.is_finished())
            .unwrap_or(false)
    }

    /// Continuously updated peer sets of the current run
    ///
    /// Yields the current set first and then every change. The stream ends
    /// when discovery stops; it is empty if discovery is not running.
    pub async fn observe_peers(&self) -> PeerStream {
        let receiver = match self.running.lock().await.as_ref() {
            Some(run) => run.run_peers.clone(),
            None => return stream::empty().boxed(),
        };

        stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first && receiver.changed().await.is_err() {
                return None;
            }
            let peers = receiver.borrow_and_update().clone();
            Some((peers, (receiver, false)))
        })
        .boxed()
    }

    /// Current peer set
    pub fn peers(&self) -> Vec<PeerDevice> {
        self.peers.borrow().clone()
    }

    /// Observe the peer set across discovery runs
    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.peers.subscribe()
    }

    /// Subscribe to discovery events
    pub fn subscribe_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Look up a peer by ID, falling back to a case-insensitive name match
    pub fn find_peer(&self, id_or_name: &str) -> Option<PeerDevice> {
        let peers = self.peers.borrow();
        peers
            .iter()
            .find(|p| p.id == id_or_name)
            .or_else(|| {
                peers
                    .iter()
                    .find(|p| p.display_name.eq_ignore_ascii_case(id_or_name))
            })
            .cloned()
    }

    /// Best-effort peer description for an ID, even if not currently heard
    pub fn resolve_peer(&self, peer_id: &str, display_name: &str) -> PeerDevice {
        self.find_peer(peer_id).unwrap_or_else(|| {
            PeerDevice::from_advertisement(
                &PeerAdvertisement {
                    peer_id: peer_id.to_string(),
                    display_name: display_name.to_string(),
                    signal_strength: 0,
                },
                &self.policy,
            )
        })
    }
}

#[derive(Debug)]
struct TrackedPeer {
    device: PeerDevice,
    last_seen: Instant,
}

/// State of one discovery run; the single writer of the peer set
struct DiscoveryTask {
    transport: Arc<dyn TransportAdapter>,
    identity: LocalIdentity,
    config: DiscoveryConfig,
    policy: ProximityPolicy,
    peers: watch::Sender<Vec<PeerDevice>>,
    run_peers: watch::Sender<Vec<PeerDevice>>,
    events: broadcast::Sender<DiscoveryEvent>,
    known: HashMap<String, TrackedPeer>,
}

impl DiscoveryTask {
    async fn run(mut self, cancel: CancellationToken) {
        let mut advertise = interval(self.config.advertise_interval);
        advertise.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut scan: Option<AdvertisementStream> = None;
        let mut retry_at = Instant::now();

        loop {
            if scan.is_none() && Instant::now() >= retry_at {
                match self.transport.discover().await {
                    Ok(stream) => {
                        debug!("Scan started");
                        scan = Some(stream);
                    }
                    Err(e) => retry_at = self.schedule_retry(&mut backoff, e.to_string()),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = advertise.tick() => {
                    if let Err(e) = self.transport.advertise(&self.identity).await {
                        warn!("Failed to advertise: {}", e);
                    }
                }

                _ = sweep.tick() => self.sweep(Instant::now()),

                item = next_advertisement(&mut scan) => match item {
                    Some(Ok(advert)) => {
                        backoff.reset();
                        self.observe(advert, Instant::now());
                    }
                    Some(Err(e)) => {
                        scan = None;
                        retry_at = self.schedule_retry(&mut backoff, e.to_string());
                    }
                    None => {
                        scan = None;
                        retry_at = self.schedule_retry(&mut backoff, "scan ended".to_string());
                    }
                },

                _ = sleep_until(retry_at), if scan.is_none() => {}
            }
        }

        debug!("Discovery task finished");
    }

    fn schedule_retry(&self, backoff: &mut Backoff, message: String) -> Instant {
        let delay = backoff.next_delay();
        warn!("Discovery scan failed: {} (retry in {:?})", message, delay);
        let _ = self.events.send(DiscoveryEvent::ScanFailed {
            message,
            retry_in: delay,
        });
        Instant::now() + delay
    }

    fn observe(&mut self, advert: PeerAdvertisement, now: Instant) {
        if advert.peer_id == self.identity.device_id {
            return;
        }
        let device = PeerDevice::from_advertisement(&advert, &self.policy);

        match self.known.get_mut(&device.id) {
            Some(tracked) => {
                tracked.last_seen = now;
                if tracked.device != device {
                    debug!(
                        "Peer {} updated: {} ({:?})",
                        device.id, device.signal_strength, device.proximity_bucket
                    );
                    tracked.device = device.clone();
                    let _ = self.events.send(DiscoveryEvent::PeerUpdated(device));
                    self.publish();
                }
            }
            None => {
                info!(
                    "Discovered peer: {} ({}) {}",
                    device.display_name,
                    device.id,
                    device.proximity_bucket.as_str()
                );
                self.known.insert(
                    device.id.clone(),
                    TrackedPeer {
                        device: device.clone(),
                        last_seen: now,
                    },
                );
                let _ = self.events.send(DiscoveryEvent::PeerDiscovered(device));
                self.publish();
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let timeout = self.config.peer_timeout;
        let expired: Vec<String> = self
            .known
            .iter()
            .filter(|(_, tracked)| now.saturating_duration_since(tracked.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return;
        }
        for peer_id in expired {
            info!("Peer timed out: {}", peer_id);
            self.known.remove(&peer_id);
            let _ = self.events.send(DiscoveryEvent::PeerLost { peer_id });
        }
        self.publish();
    }

    fn publish(&self) {
        let mut peers: Vec<PeerDevice> = self.known.values().map(|t| t.device.clone()).collect();
        peers.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.run_peers.send_replace(peers.clone());
        self.peers.send_replace(peers);
    }
}

async fn next_advertisement(
    scan: &mut Option<AdvertisementStream>,
) -> Option<Result<PeerAdvertisement>> {
    match scan {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ProximityBucket;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            advertise_interval: Duration::from_millis(20),
            peer_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(20),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
        }
    }

    async fn registry(network: &MemoryNetwork, id: &str) -> DeviceRegistry {
        let transport = Arc::new(network.endpoint(id).await);
        DeviceRegistry::new(
            transport,
            LocalIdentity::with_id(id, id.to_uppercase()),
            fast_config(),
            ProximityPolicy::default(),
        )
    }

    async fn wait_for<F>(stream: &mut PeerStream, predicate: F) -> Vec<PeerDevice>
    where
        F: Fn(&[PeerDevice]) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let peers = stream.next().await.expect("peer stream ended");
                if predicate(&peers) {
                    return peers;
                }
            }
        })
        .await
        .expect("condition not reached in time")
    }

    #[tokio::test]
    async fn test_two_registries_see_each_other() {
        let network = MemoryNetwork::new();
        let laptop = registry(&network, "laptop").await;
        let phone = registry(&network, "phone").await;
        network.set_signal_strength("phone", 30).await;

        laptop.start_discovery().await;
        phone.start_discovery().await;

        let mut stream = laptop.observe_peers().await;
        let peers = wait_for(&mut stream, |p| !p.is_empty()).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "phone");
        assert_eq!(peers[0].display_name, "PHONE");
        assert_eq!(peers[0].proximity_bucket, ProximityBucket::Far);

        assert!(laptop.find_peer("phone").is_some());
        assert!(laptop.find_peer("Phone").is_some());
        assert!(laptop.find_peer("laptop").is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_ends_stream() {
        let network = MemoryNetwork::new();
        let laptop = registry(&network, "laptop").await;

        laptop.start_discovery().await;
        laptop.start_discovery().await;
        assert!(laptop.is_running().await);

        let mut stream = laptop.observe_peers().await;
        assert_eq!(stream.next().await, Some(Vec::new()));

        laptop.stop_discovery().await;
        laptop.stop_discovery().await;
        assert!(!laptop.is_running().await);

        let rest = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(rest, None);
    }

    #[tokio::test]
    async fn test_silent_peer_is_removed() {
        let network = MemoryNetwork::new();
        let laptop = registry(&network, "laptop").await;
        let phone = registry(&network, "phone").await;

        laptop.start_discovery().await;
        phone.start_discovery().await;
        let mut stream = laptop.observe_peers().await;
        wait_for(&mut stream, |p| p.iter().any(|d| d.id == "phone")).await;

        network.set_in_range("phone", false).await;
        let peers = wait_for(&mut stream, |p| p.is_empty()).await;
        assert!(peers.is_empty());
        assert!(laptop.peers().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failures_are_retried() {
        let network = MemoryNetwork::new();
        let laptop = registry(&network, "laptop").await;
        let phone = registry(&network, "phone").await;
        network.fail_scans("laptop", 3).await;

        let mut events = laptop.subscribe_events();
        laptop.start_discovery().await;
        phone.start_discovery().await;

        let mut stream = laptop.observe_peers().await;
        wait_for(&mut stream, |p| !p.is_empty()).await;

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if let DiscoveryEvent::ScanFailed { retry_in, .. } = event {
                assert!(retry_in <= Duration::from_millis(40));
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_observe_without_discovery_is_empty() {
        let network = MemoryNetwork::new();
        let laptop = registry(&network, "laptop").await;
        assert_eq!(laptop.observe_peers().await.next().await, None);
    }
}

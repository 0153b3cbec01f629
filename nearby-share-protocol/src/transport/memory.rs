//! In-process transport
//!
//! A [`MemoryNetwork`] is a hub that any number of [`MemoryTransport`]
//! endpoints join. Advertisements travel over a broadcast bus and
//! connections are `tokio::io::duplex` pipes, so two engines in the same
//! process can discover each other and transfer files without sockets.
//!
//! The hub also lets tests shape the radio environment: per-endpoint signal
//! strength, walking out of range, and failing scans.

use super::r#trait::{AdvertisementStream, DuplexChannel, TransportAdapter, TransportType};
use super::stream::StreamChannel;
use crate::device::{LocalIdentity, PeerAdvertisement};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::debug;

/// Buffer size of each direction of a memory channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256 * 1024;

/// Signal strength of a newly joined endpoint
pub const DEFAULT_SIGNAL_STRENGTH: u8 = 80;

const BEACON_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Beacon {
    peer_id: String,
    display_name: String,
    signal_strength: u8,
}

#[derive(Debug)]
struct Endpoint {
    inbound: mpsc::UnboundedSender<Box<dyn DuplexChannel>>,
    signal_strength: u8,
    in_range: bool,
    failing_scans: u32,
}

#[derive(Debug)]
struct NetworkInner {
    beacons: broadcast::Sender<Beacon>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    channel_capacity: usize,
}

/// Shared in-process hub
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub whose channels buffer `capacity` bytes per direction
    pub fn with_channel_capacity(capacity: usize) -> Self {
        let (beacons, _) = broadcast::channel(BEACON_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                beacons,
                endpoints: RwLock::new(HashMap::new()),
                channel_capacity: capacity.max(1),
            }),
        }
    }

    /// Join the hub as `peer_id`
    ///
    /// Joining again with the same ID replaces the previous endpoint.
    pub async fn endpoint(&self, peer_id: impl Into<String>) -> MemoryTransport {
        let peer_id = peer_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.write().await.insert(
            peer_id.clone(),
            Endpoint {
                inbound: tx,
                signal_strength: DEFAULT_SIGNAL_STRENGTH,
                in_range: true,
                failing_scans: 0,
            },
        );
        debug!("Memory endpoint {} joined", peer_id);

        MemoryTransport {
            peer_id,
            network: self.clone(),
            inbound: Mutex::new(rx),
        }
    }

    /// Change the strength others hear from `peer_id`
    pub async fn set_signal_strength(&self, peer_id: &str, signal_strength: u8) {
        if let Some(endpoint) = self.inner.endpoints.write().await.get_mut(peer_id) {
            endpoint.signal_strength = signal_strength;
        }
    }

    /// Move `peer_id` in or out of range
    ///
    /// Out of range endpoints stop advertising and refuse connections.
    pub async fn set_in_range(&self, peer_id: &str, in_range: bool) {
        if let Some(endpoint) = self.inner.endpoints.write().await.get_mut(peer_id) {
            endpoint.in_range = in_range;
        }
    }

    /// Make the next `count` scans started by `peer_id` fail
    pub async fn fail_scans(&self, peer_id: &str, count: u32) {
        if let Some(endpoint) = self.inner.endpoints.write().await.get_mut(peer_id) {
            endpoint.failing_scans = count;
        }
    }
}

/// One device on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    peer_id: String,
    network: MemoryNetwork,
    inbound: Mutex<mpsc::UnboundedReceiver<Box<dyn DuplexChannel>>>,
}

impl MemoryTransport {
    /// ID this endpoint joined the hub with
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The hub this endpoint belongs to
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Memory
    }

    async fn advertise(&self, identity: &LocalIdentity) -> Result<()> {
        let endpoints = self.network.inner.endpoints.read().await;
        let endpoint = endpoints
            .get(&self.peer_id)
            .ok_or_else(|| ProtocolError::Transport("endpoint left the network".to_string()))?;
        if !endpoint.in_range {
            return Ok(());
        }

        // No subscribers simply means nobody is scanning
        let _ = self.network.inner.beacons.send(Beacon {
            peer_id: self.peer_id.clone(),
            display_name: identity.display_name.clone(),
            signal_strength: endpoint.signal_strength,
        });
        Ok(())
    }

    async fn discover(&self) -> Result<AdvertisementStream> {
        {
            let mut endpoints = self.network.inner.endpoints.write().await;
            if let Some(endpoint) = endpoints.get_mut(&self.peer_id) {
                if endpoint.failing_scans > 0 {
                    endpoint.failing_scans -= 1;
                    return Err(ProtocolError::Transport("radio scan failed".to_string()));
                }
            }
        }

        let receiver = self.network.inner.beacons.subscribe();
        let own_id = self.peer_id.clone();

        let adverts = stream::unfold(receiver, move |mut receiver| {
            let own_id = own_id.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(beacon) if beacon.peer_id == own_id => continue,
                        Ok(beacon) => {
                            let advert = PeerAdvertisement {
                                peer_id: beacon.peer_id,
                                display_name: beacon.display_name,
                                signal_strength: beacon.signal_strength,
                            };
                            return Some((Ok(advert), receiver));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Discovery lagged, skipped {} beacons", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(adverts.boxed())
    }

    async fn connect(&self, peer_id: &str) -> Result<Box<dyn DuplexChannel>> {
        let endpoints = self.network.inner.endpoints.read().await;
        let target = endpoints
            .get(peer_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(peer_id.to_string()))?;
        if !target.in_range {
            return Err(ProtocolError::Transport(format!(
                "peer {} is out of range",
                peer_id
            )));
        }

        let (local, remote) = tokio::io::duplex(self.network.inner.channel_capacity);
        let remote: Box<dyn DuplexChannel> = Box::new(StreamChannel::new(
            remote,
            self.peer_id.clone(),
            TransportType::Memory,
        ));
        target.inbound.send(remote).map_err(|_| {
            ProtocolError::Transport(format!("peer {} is not accepting connections", peer_id))
        })?;

        debug!("Memory channel {} -> {} opened", self.peer_id, peer_id);
        Ok(Box::new(StreamChannel::new(
            local,
            peer_id.to_string(),
            TransportType::Memory,
        )))
    }

    async fn accept(&self) -> Result<Box<dyn DuplexChannel>> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ProtocolError::Transport("memory network closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_advertisement_reaches_other_endpoints_only() {
        let network = MemoryNetwork::new();
        let laptop = network.endpoint("laptop").await;
        let phone = network.endpoint("phone").await;
        network.set_signal_strength("phone", 42).await;

        let mut laptop_scan = laptop.discover().await.unwrap();
        let mut phone_scan = phone.discover().await.unwrap();

        phone
            .advertise(&LocalIdentity::with_id("phone", "Phone"))
            .await
            .unwrap();

        let advert = laptop_scan.next().await.unwrap().unwrap();
        assert_eq!(advert.peer_id, "phone");
        assert_eq!(advert.display_name, "Phone");
        assert_eq!(advert.signal_strength, 42);

        let own = tokio::time::timeout(Duration::from_millis(50), phone_scan.next()).await;
        assert!(own.is_err(), "an endpoint must not hear itself");
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let network = MemoryNetwork::new();
        let laptop = network.endpoint("laptop").await;
        let phone = network.endpoint("phone").await;

        let mut outbound = laptop.connect("phone").await.unwrap();
        let mut inbound = phone.accept().await.unwrap();
        assert_eq!(outbound.peer_id(), "phone");
        assert_eq!(inbound.peer_id(), "laptop");

        outbound.write(b"ping").await.unwrap();
        assert_eq!(inbound.read(16).await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_out_of_range_peer() {
        let network = MemoryNetwork::new();
        let laptop = network.endpoint("laptop").await;
        let _phone = network.endpoint("phone").await;
        network.set_in_range("phone", false).await;

        assert!(matches!(
            laptop.connect("phone").await,
            Err(ProtocolError::Transport(_))
        ));
        assert!(matches!(
            laptop.connect("ghost").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_scans() {
        let network = MemoryNetwork::new();
        let laptop = network.endpoint("laptop").await;
        network.fail_scans("laptop", 2).await;

        assert!(laptop.discover().await.is_err());
        assert!(laptop.discover().await.is_err());
        assert!(laptop.discover().await.is_ok());
    }
}

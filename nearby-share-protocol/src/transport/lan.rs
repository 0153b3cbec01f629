//! LAN transport
//!
//! Devices announce themselves with a UDP broadcast carrying a small JSON
//! identity and accept sessions on a TCP listener. A LAN link has no radio
//! signal measurement, so every advertisement reports the configured
//! nominal strength.

use super::r#trait::{AdvertisementStream, DuplexChannel, TransportAdapter, TransportType};
use super::stream::StreamChannel;
use crate::device::{LocalIdentity, PeerAdvertisement};
use crate::{ProtocolError, Result, PROTOCOL_VERSION};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default UDP port for advertisements
pub const DEFAULT_DISCOVERY_PORT: u16 = 1739;

/// Strength reported for every LAN peer
pub const DEFAULT_NOMINAL_SIGNAL_STRENGTH: u8 = 60;

/// Default timeout for TCP connects
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_DATAGRAM_SIZE: usize = 4096;

/// LAN transport configuration
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// UDP port advertisements are sent to and heard on
    pub discovery_port: u16,

    /// TCP listen port (0 picks a free port)
    pub tcp_port: u16,

    /// Destination of advertisements
    pub broadcast_addr: Ipv4Addr,

    /// Signal strength reported for discovered peers
    pub nominal_signal_strength: u8,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            tcp_port: 0,
            broadcast_addr: Ipv4Addr::BROADCAST,
            nominal_signal_strength: DEFAULT_NOMINAL_SIGNAL_STRENGTH,
        }
    }
}

/// Identity datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LanIdentity {
    device_id: String,
    device_name: String,
    tcp_port: u16,
    protocol_version: u32,
}

/// UDP + TCP transport for devices on the same network segment
#[derive(Debug)]
pub struct LanTransport {
    config: LanConfig,
    listener: TcpListener,
    tcp_port: u16,
    advert_socket: UdpSocket,
    /// Where each discovered device accepts connections
    known_peers: Arc<RwLock<HashMap<String, SocketAddr>>>,
}

impl LanTransport {
    /// Bind the TCP listener and the advertisement socket
    ///
    /// # Errors
    ///
    /// Returns an error if either socket cannot be bound.
    pub async fn bind(config: LanConfig) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding TCP listener"))?;
        let tcp_port = listener.local_addr()?.port();

        let advert_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding advertisement socket"))?;
        advert_socket.set_broadcast(true)?;

        info!("LAN transport listening on TCP port {}", tcp_port);

        Ok(Self {
            config,
            listener,
            tcp_port,
            advert_socket,
            known_peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// TCP port inbound sessions arrive on
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Register a peer reachable at `addr` without waiting for discovery
    pub async fn add_peer(&self, peer_id: impl Into<String>, addr: SocketAddr) {
        self.known_peers.write().await.insert(peer_id.into(), addr);
    }

    fn parse_identity(data: &[u8], src_addr: SocketAddr) -> Result<(PeerAdvertisement, SocketAddr)> {
        let identity: LanIdentity = serde_json::from_slice(data)?;
        if identity.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidPacket(format!(
                "unsupported identity version {}",
                identity.protocol_version
            )));
        }
        let tcp_addr = SocketAddr::new(src_addr.ip(), identity.tcp_port);
        let advert = PeerAdvertisement {
            peer_id: identity.device_id,
            display_name: identity.device_name,
            signal_strength: 0,
        };
        Ok((advert, tcp_addr))
    }
}

#[async_trait]
impl TransportAdapter for LanTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Lan
    }

    async fn advertise(&self, identity: &LocalIdentity) -> Result<()> {
        let datagram = serde_json::to_vec(&LanIdentity {
            device_id: identity.device_id.clone(),
            device_name: identity.display_name.clone(),
            tcp_port: self.tcp_port,
            protocol_version: PROTOCOL_VERSION,
        })?;
        let target = SocketAddr::new(IpAddr::V4(self.config.broadcast_addr), self.config.discovery_port);

        let sent = self
            .advert_socket
            .send_to(&datagram, target)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending advertisement"))?;
        debug!("Broadcast identity ({} bytes) to {}", sent, target);
        Ok(())
    }

    async fn discover(&self) -> Result<AdvertisementStream> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding discovery socket"))?;
        socket.set_broadcast(true)?;
        debug!("Listening for advertisements on UDP {}", self.config.discovery_port);

        let known_peers = self.known_peers.clone();
        let strength = self.config.nominal_signal_strength;

        let adverts = stream::unfold(Some(socket), move |state| {
            let known_peers = known_peers.clone();
            async move {
                let socket = state?;
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((size, src_addr)) => match Self::parse_identity(&buf[..size], src_addr) {
                            Ok((mut advert, tcp_addr)) => {
                                advert.signal_strength = strength;
                                known_peers
                                    .write()
                                    .await
                                    .insert(advert.peer_id.clone(), tcp_addr);
                                return Some((Ok(advert), Some(socket)));
                            }
                            Err(e) => {
                                debug!("Ignoring datagram from {}: {}", src_addr, e);
                            }
                        },
                        Err(e) => {
                            warn!("Discovery socket failed: {}", e);
                            let error = ProtocolError::from_io_error(e, "receiving advertisement");
                            return Some((Err(error), None));
                        }
                    }
                }
            }
        });

        Ok(adverts.boxed())
    }

    async fn connect(&self, peer_id: &str) -> Result<Box<dyn DuplexChannel>> {
        let addr = self
            .known_peers
            .read()
            .await
            .get(peer_id)
            .copied()
            .ok_or_else(|| ProtocolError::DeviceNotFound(peer_id.to_string()))?;

        debug!("Connecting to {} at {}", peer_id, addr);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting to peer"))?;
        stream.set_nodelay(true)?;

        Ok(Box::new(StreamChannel::new(stream, peer_id, TransportType::Lan)))
    }

    async fn accept(&self) -> Result<Box<dyn DuplexChannel>> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "accepting connection"))?;
        stream.set_nodelay(true)?;
        debug!("Accepted connection from {}", addr);

        Ok(Box::new(StreamChannel::new(
            stream,
            addr.to_string(),
            TransportType::Lan,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_uses_advertised_tcp_port() {
        let datagram = br#"{"deviceId":"desk_1","deviceName":"Desk","tcpPort":4000,"protocolVersion":1}"#;
        let src: SocketAddr = "192.168.1.20:5555".parse().unwrap();

        let (advert, tcp_addr) = LanTransport::parse_identity(datagram, src).unwrap();
        assert_eq!(advert.peer_id, "desk_1");
        assert_eq!(advert.display_name, "Desk");
        assert_eq!(tcp_addr, "192.168.1.20:4000".parse().unwrap());
    }

    #[test]
    fn test_parse_identity_rejects_other_versions() {
        let datagram = br#"{"deviceId":"x","deviceName":"X","tcpPort":1,"protocolVersion":9}"#;
        let src: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert!(matches!(
            LanTransport::parse_identity(datagram, src),
            Err(ProtocolError::InvalidPacket(_))
        ));
        assert!(LanTransport::parse_identity(b"not json", src).is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept_over_loopback() {
        let server = LanTransport::bind(LanConfig::default()).await.unwrap();
        let client = LanTransport::bind(LanConfig::default()).await.unwrap();
        client
            .add_peer("server", SocketAddr::from(([127, 0, 0, 1], server.tcp_port())))
            .await;

        let accept = tokio::spawn(async move {
            let mut channel = server.accept().await.unwrap();
            channel.read(16).await.unwrap()
        });

        let mut channel = client.connect("server").await.unwrap();
        assert_eq!(channel.peer_id(), "server");
        channel.write(b"hi").await.unwrap();

        assert_eq!(accept.await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        let client = LanTransport::bind(LanConfig::default()).await.unwrap();
        assert!(matches!(
            client.connect("nobody").await,
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }
}

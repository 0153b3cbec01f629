//! Transport Trait Abstraction
//!
//! Defines the interface the engine consumes from the underlying local
//! wireless link. Implementations own advertisement, discovery and socket
//! establishment; the engine only sees advertisements and byte channels.

use crate::device::{LocalIdentity, PeerAdvertisement};
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;

/// Continuous sequence of advertisements heard by a scan
///
/// An `Err` item reports a scan failure; the stream may end afterwards.
pub type AdvertisementStream = BoxStream<'static, Result<PeerAdvertisement>>;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// In-process hub
    Memory,

    /// UDP discovery plus TCP channels
    Lan,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Memory => write!(f, "Memory"),
            TransportType::Lan => write!(f, "LAN"),
        }
    }
}

/// One established, ordered, reliable byte stream to a peer
#[async_trait]
pub trait DuplexChannel: Send + Debug {
    /// Identifier of the remote end as known to the transport
    fn peer_id(&self) -> &str;

    /// Read up to `max_bytes`
    ///
    /// Returns an empty buffer once the peer has closed its side.
    ///
    /// # Errors
    ///
    /// Returns `Transport` on connection failures.
    async fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>>;

    /// Write all of `bytes`, waiting on the transport's flow control
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the peer is gone.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the channel gracefully
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be closed cleanly.
    async fn close(&mut self) -> Result<()>;
}

/// Advertisement, discovery and connection primitives of a link
#[async_trait]
pub trait TransportAdapter: Send + Sync + Debug {
    /// Get the transport type
    fn transport_type(&self) -> TransportType;

    /// Announce this device once; called periodically by the registry
    async fn advertise(&self, identity: &LocalIdentity) -> Result<()>;

    /// Start a scan
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be started at all.
    async fn discover(&self) -> Result<AdvertisementStream>;

    /// Open a channel to a discovered peer
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for unknown peers and `Transport` when the
    /// peer cannot be reached.
    async fn connect(&self, peer_id: &str) -> Result<Box<dyn DuplexChannel>>;

    /// Wait for the next inbound channel
    async fn accept(&self) -> Result<Box<dyn DuplexChannel>>;
}

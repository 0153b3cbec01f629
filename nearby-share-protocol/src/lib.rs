//! Nearby Share Protocol
//!
//! Offline peer-to-peer file transfer between nearby devices: discovery,
//! manifest negotiation, a checksummed chunk pipeline with retransmission,
//! progress metrics and an append-only history of finished sessions.
//!
//! The entry point is [`TransferController`], an explicitly owned engine
//! built over a [`TransportAdapter`] and a [`FileStorage`].

pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod history;
pub mod negotiator;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod transport;
pub mod wire;

mod error;

pub use config::{DiscoveryConfig, EngineConfig, ProgressConfig, TransferConfig};
pub use controller::{IncomingOffer, TransferController};
pub use device::{LocalIdentity, PeerAdvertisement, PeerDevice, ProximityBucket, ProximityPolicy};
pub use discovery::{DeviceRegistry, DiscoveryEvent, PeerStream};
pub use error::{ProtocolError, Result};
pub use history::{Direction, HistoryFile, HistoryLedger, HistoryRecord};
pub use negotiator::{SessionNegotiator, SessionSlot, SlotGuard};
pub use pipeline::{ChunkPipeline, TransferObserver};
pub use progress::{ProgressSnapshot, ProgressTracker, SessionPublisher};
pub use recovery::Backoff;
pub use session::{
    FailureKind, FileDescriptor, FileHandle, MediaKind, Role, SessionId, SessionStatus,
    TransferSession,
};
pub use storage::{ByteSink, ByteSource, FileStat, FileStorage, FsStorage, MemoryStorage};
pub use transport::{
    DuplexChannel, LanConfig, LanTransport, MemoryNetwork, MemoryTransport, StreamChannel,
    TransportAdapter, TransportType,
};

/// Version of the advertisement identity format
pub const PROTOCOL_VERSION: u32 = 1;

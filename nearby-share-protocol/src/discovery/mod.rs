//! Device Discovery
//!
//! Maintains the live, deduplicated set of reachable peers.
//!
//! ## Architecture
//!
//! The [`DeviceRegistry`] runs one background task per discovery run. The
//! task is the only writer of the peer set and multiplexes three duties:
//! - Advertiser: announces this device every `advertise_interval`
//! - Scanner: consumes the transport's advertisement stream, restarting
//!   it with exponential backoff when it fails
//! - Sweeper: drops peers silent for longer than `peer_timeout`
//!
//! Readers get the peer set through watch channels and lifecycle changes
//! through [`DiscoveryEvent`]s.

mod events;
mod registry;

pub use events::DiscoveryEvent;
pub use registry::{DeviceRegistry, PeerStream};

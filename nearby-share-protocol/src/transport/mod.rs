//! Nearby Share Transport Layer
//!
//! The engine talks to the local wireless link through two traits:
//! [`TransportAdapter`] for advertisement, discovery and connection
//! establishment, and [`DuplexChannel`] for the byte stream of one session.
//!
//! Two adapters ship with the crate:
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process hub for tests and demos
//! - [`LanTransport`]: UDP broadcast discovery plus TCP channels

mod r#trait;
pub mod lan;
pub mod memory;
pub mod stream;

pub use lan::{LanConfig, LanTransport, DEFAULT_DISCOVERY_PORT};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use r#trait::{AdvertisementStream, DuplexChannel, TransportAdapter, TransportType};
pub use stream::StreamChannel;

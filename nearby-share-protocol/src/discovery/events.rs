//! Discovery Event System
//!
//! This module defines events emitted by the device registry.

use crate::device::PeerDevice;
use std::time::Duration;

/// Events emitted by the device registry
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Discovery started
    Started,

    /// A new peer was heard for the first time
    PeerDiscovered(PeerDevice),

    /// A known peer re-advertised with a different name or signal strength
    PeerUpdated(PeerDevice),

    /// A peer stayed silent for longer than the liveness window
    PeerLost {
        /// ID of the peer that timed out
        peer_id: String,
    },

    /// A scan failed and will be retried
    ScanFailed {
        /// Error message
        message: String,
        /// Delay before the next attempt
        retry_in: Duration,
    },

    /// Discovery stopped
    Stopped,
}

impl DiscoveryEvent {
    /// Get the peer ID this event refers to, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            DiscoveryEvent::PeerDiscovered(peer) | DiscoveryEvent::PeerUpdated(peer) => {
                Some(&peer.id)
            }
            DiscoveryEvent::PeerLost { peer_id } => Some(peer_id),
            _ => None,
        }
    }

    /// Check if this event changes the peer set
    pub fn changes_peer_set(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::PeerDiscovered(_) | DiscoveryEvent::PeerLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ProximityBucket;

    #[test]
    fn test_event_peer_id() {
        let peer = PeerDevice {
            id: "tablet".to_string(),
            display_name: "Tablet".to_string(),
            signal_strength: 40,
            proximity_bucket: ProximityBucket::Near,
        };
        assert_eq!(
            DiscoveryEvent::PeerDiscovered(peer.clone()).peer_id(),
            Some("tablet")
        );
        assert_eq!(
            DiscoveryEvent::PeerLost {
                peer_id: "tablet".to_string()
            }
            .peer_id(),
            Some("tablet")
        );
        assert_eq!(DiscoveryEvent::Started.peer_id(), None);
        assert!(!DiscoveryEvent::PeerUpdated(peer).changes_peer_set());
    }
}

//! Peer Device Model
//!
//! Types describing this device and the peers discovered around it.

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity this device advertises to its neighbours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    /// Stable device identifier
    pub device_id: String,

    /// Human-readable device name
    pub display_name: String,
}

impl LocalIdentity {
    /// Create an identity with a freshly generated device ID
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            device_id: Uuid::new_v4().to_string().replace('-', "_"),
            display_name: display_name.into(),
        }
    }

    /// Create an identity with an explicit device ID
    pub fn with_id(device_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// One advertisement heard during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAdvertisement {
    /// Advertising device's identifier
    pub peer_id: String,

    /// Advertising device's name
    pub display_name: String,

    /// Received signal strength, 0 (weakest) to 100 (strongest)
    pub signal_strength: u8,
}

/// Coarse distance estimate derived from signal strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProximityBucket {
    /// Practically touching
    Immediate,
    /// Same room
    Near,
    /// Reachable but distant
    Far,
}

impl ProximityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProximityBucket::Immediate => "immediate",
            ProximityBucket::Near => "near",
            ProximityBucket::Far => "far",
        }
    }
}

/// Signal strength thresholds for each proximity bucket
///
/// The transport gives no calibrated distance, so the boundaries are
/// tunable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProximityPolicy {
    /// Minimum strength for `Immediate`
    pub immediate_threshold: u8,

    /// Minimum strength for `Near`
    pub near_threshold: u8,
}

impl Default for ProximityPolicy {
    fn default() -> Self {
        Self {
            immediate_threshold: 70,
            near_threshold: 35,
        }
    }
}

impl ProximityPolicy {
    /// Map a signal strength to its bucket
    pub fn bucket_for(&self, signal_strength: u8) -> ProximityBucket {
        let strength = signal_strength.min(100);
        if strength >= self.immediate_threshold {
            ProximityBucket::Immediate
        } else if strength >= self.near_threshold {
            ProximityBucket::Near
        } else {
            ProximityBucket::Far
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.near_threshold > self.immediate_threshold || self.immediate_threshold > 100 {
            return Err(ProtocolError::Configuration(format!(
                "proximity thresholds must satisfy near ({}) <= immediate ({}) <= 100",
                self.near_threshold, self.immediate_threshold
            )));
        }
        Ok(())
    }
}

/// A reachable peer as seen by the device registry
///
/// `id` is stable for the lifetime of a session; the other fields are
/// refreshed on every advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDevice {
    /// Stable peer identifier
    pub id: String,

    /// Human-readable peer name
    pub display_name: String,

    /// Last reported signal strength (0..=100)
    pub signal_strength: u8,

    /// Bucket derived from `signal_strength`
    pub proximity_bucket: ProximityBucket,
}

impl PeerDevice {
    /// Build a peer from an advertisement using the given policy
    pub fn from_advertisement(advertisement: &PeerAdvertisement, policy: &ProximityPolicy) -> Self {
        let signal_strength = advertisement.signal_strength.min(100);
        Self {
            id: advertisement.peer_id.clone(),
            display_name: advertisement.display_name.clone(),
            signal_strength,
            proximity_bucket: policy.bucket_for(signal_strength),
        }
    }
}

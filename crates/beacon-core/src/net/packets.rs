//! Request and response messages of the peer and public surfaces
//!
//! Every message that targets one network carries a `beacon_id`. The
//! empty identifier means the sender did not set it.

use crate::dkg::Bundle;
use crate::types::{hex_bytes, Beacon, Group, Identity, NetworkId};
use serde::{Deserialize, Serialize};

/// Partial signature of one node for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBeaconPacket {
    #[serde(default)]
    pub beacon_id: NetworkId,
    pub round: u64,
    #[serde(with = "hex_bytes")]
    pub previous_signature: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub partial_sig: Vec<u8>,
}

/// DKG bundle relayed between participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgPacket {
    #[serde(default)]
    pub beacon_id: NetworkId,
    pub bundle: Bundle,
}

/// A participant announcing itself to the setup leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDkgPacket {
    #[serde(default)]
    pub beacon_id: NetworkId,
    pub node: Identity,
    /// Hash of the setup secret
    #[serde(with = "hex_bytes")]
    pub secret_proof: Vec<u8>,
}

/// Group and timing pushed by the leader once every participant signaled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgInfoPacket {
    #[serde(default)]
    pub beacon_id: NetworkId,
    pub new_group: Group,
    /// Group being reshared, absent for a fresh setup
    #[serde(default)]
    pub old_group: Option<Group>,
    #[serde(with = "hex_bytes")]
    pub secret_proof: Vec<u8>,
    /// Phase timeout in seconds
    pub dkg_timeout: u64,
}

/// Ask a peer for its chain from a given round onward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub beacon_id: NetworkId,
    pub from_round: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRandRequest {
    #[serde(default)]
    pub beacon_id: NetworkId,
    /// 0 asks for the latest round
    #[serde(default)]
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRandResponse {
    pub round: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub previous_signature: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub randomness: Vec<u8>,
}

impl From<&Beacon> for PublicRandResponse {
    fn from(beacon: &Beacon) -> Self {
        Self {
            round: beacon.round,
            signature: beacon.signature.clone(),
            previous_signature: beacon.previous_signature.clone(),
            randomness: beacon.randomness(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfoRequest {
    #[serde(default)]
    pub beacon_id: NetworkId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeRequest {
    #[serde(default)]
    pub beacon_id: NetworkId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeResponse {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRequest {
    #[serde(default)]
    pub beacon_id: NetworkId,
}

//! Network surface of a beacon node
//!
//! [`Service`] is what a node answers, [`ProtocolClient`] is how it calls
//! other nodes. The wire encoding lives outside this crate; the in-memory
//! [`MemoryNetwork`] wires services directly together.

pub mod memory;
mod packets;

pub use memory::MemoryNetwork;
pub use packets::*;

pub use ::async_trait::async_trait;

use crate::types::{Beacon, ChainInfo, Identity};
use crate::Result;
use std::fmt;
use tokio::sync::mpsc;

/// The remote end of an inbound call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub address: String,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Operations a node answers, both to peers and to public clients.
///
/// Streaming calls push into the given sender and return once the stream
/// ends; a dropped receiver ends the stream.
#[async_trait]
pub trait Service: Send + Sync {
    /// Round `req.round`, or the latest one for round 0
    async fn public_rand(&self, peer: &Peer, req: PublicRandRequest) -> Result<PublicRandResponse>;

    /// Stored rounds from `req.round`, then every new round
    async fn public_rand_stream(
        &self,
        peer: &Peer,
        req: PublicRandRequest,
        tx: mpsc::Sender<PublicRandResponse>,
    ) -> Result<()>;

    async fn chain_info(&self, peer: &Peer, req: ChainInfoRequest) -> Result<ChainInfo>;

    async fn home(&self, peer: &Peer, req: HomeRequest) -> Result<HomeResponse>;

    async fn partial_beacon(&self, peer: &Peer, packet: PartialBeaconPacket) -> Result<()>;

    async fn broadcast_dkg(&self, peer: &Peer, packet: DkgPacket) -> Result<()>;

    async fn signal_dkg_participant(&self, peer: &Peer, packet: SignalDkgPacket) -> Result<()>;

    async fn push_dkg_info(&self, peer: &Peer, packet: DkgInfoPacket) -> Result<()>;

    /// Stored rounds from `req.from_round` onward, in order
    async fn sync_chain(&self, peer: &Peer, req: SyncRequest, tx: mpsc::Sender<Beacon>) -> Result<()>;

    async fn get_identity(&self, peer: &Peer, req: IdentityRequest) -> Result<Identity>;
}

/// Outgoing calls to other nodes, addressed by their public address
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn partial_beacon(&self, to: &str, packet: PartialBeaconPacket) -> Result<()>;

    async fn broadcast_dkg(&self, to: &str, packet: DkgPacket) -> Result<()>;

    async fn signal_dkg_participant(&self, to: &str, packet: SignalDkgPacket) -> Result<()>;

    async fn push_dkg_info(&self, to: &str, packet: DkgInfoPacket) -> Result<()>;

    /// Open a chain sync stream; it ends when the peer has nothing more
    async fn sync_chain(&self, to: &str, req: SyncRequest) -> Result<mpsc::Receiver<Beacon>>;

    async fn get_identity(&self, to: &str, req: IdentityRequest) -> Result<Identity>;

    async fn chain_info(&self, to: &str, req: ChainInfoRequest) -> Result<ChainInfo>;

    async fn public_rand(&self, to: &str, req: PublicRandRequest) -> Result<PublicRandResponse>;
}

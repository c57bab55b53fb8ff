//! In-memory network for testing and single-process simulations

use super::*;
use crate::Error;
use dashmap::DashMap;
use std::sync::Arc;

/// Capacity of the channel behind a sync stream
const SYNC_BUFFER: usize = 64;

/// Services reachable by address, all living in this process
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<String, Arc<dyn Service>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable at `address`
    pub fn register(&self, address: &str, service: Arc<dyn Service>) {
        self.nodes.insert(address.to_string(), service);
    }

    /// Take a node off the network; calls to it fail from now on
    pub fn disconnect(&self, address: &str) {
        self.nodes.remove(address);
    }

    /// Client issuing calls on behalf of the node at `own_address`
    pub fn client(&self, own_address: &str) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            network: self.clone(),
            own: Peer::new(own_address),
        })
    }

    fn service(&self, address: &str) -> Result<Arc<dyn Service>> {
        self.nodes
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Transport(format!("{} unreachable", address)))
    }
}

/// Outgoing side of one node on a [`MemoryNetwork`]
pub struct MemoryClient {
    network: MemoryNetwork,
    own: Peer,
}

#[async_trait]
impl ProtocolClient for MemoryClient {
    async fn partial_beacon(&self, to: &str, packet: PartialBeaconPacket) -> Result<()> {
        self.network.service(to)?.partial_beacon(&self.own, packet).await
    }

    async fn broadcast_dkg(&self, to: &str, packet: DkgPacket) -> Result<()> {
        self.network.service(to)?.broadcast_dkg(&self.own, packet).await
    }

    async fn signal_dkg_participant(&self, to: &str, packet: SignalDkgPacket) -> Result<()> {
        self.network
            .service(to)?
            .signal_dkg_participant(&self.own, packet)
            .await
    }

    async fn push_dkg_info(&self, to: &str, packet: DkgInfoPacket) -> Result<()> {
        self.network.service(to)?.push_dkg_info(&self.own, packet).await
    }

    async fn sync_chain(&self, to: &str, req: SyncRequest) -> Result<mpsc::Receiver<Beacon>> {
        let service = self.network.service(to)?;
        let (tx, rx) = mpsc::channel(SYNC_BUFFER);
        let peer = self.own.clone();
        tokio::spawn(async move {
            if let Err(e) = service.sync_chain(&peer, req, tx).await {
                tracing::debug!(peer = %peer, error = %e, "memory sync stream ended");
            }
        });
        Ok(rx)
    }

    async fn get_identity(&self, to: &str, req: IdentityRequest) -> Result<Identity> {
        self.network.service(to)?.get_identity(&self.own, req).await
    }

    async fn chain_info(&self, to: &str, req: ChainInfoRequest) -> Result<ChainInfo> {
        self.network.service(to)?.chain_info(&self.own, req).await
    }

    async fn public_rand(&self, to: &str, req: PublicRandRequest) -> Result<PublicRandResponse> {
        self.network.service(to)?.public_rand(&self.own, req).await
    }
}

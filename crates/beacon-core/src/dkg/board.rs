//! Board sending DKG bundles to the other participants over the network

use super::{Board, Bundle};
use crate::net::{DkgPacket, ProtocolClient};
use crate::types::NetworkId;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends every bundle to all other participants concurrently
pub struct Broadcaster {
    client: Arc<dyn ProtocolClient>,
    beacon_id: NetworkId,
    peers: Vec<String>,
}

impl Broadcaster {
    pub fn new(client: Arc<dyn ProtocolClient>, beacon_id: NetworkId, peers: Vec<String>) -> Self {
        Self {
            client,
            beacon_id,
            peers,
        }
    }
}

#[async_trait]
impl Board for Broadcaster {
    async fn push(&self, bundle: Bundle) {
        let packet = DkgPacket {
            beacon_id: self.beacon_id.clone(),
            bundle,
        };
        let sends = self.peers.iter().map(|peer| {
            let packet = packet.clone();
            async move { (peer, self.client.broadcast_dkg(peer, packet).await) }
        });
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => debug!(peer = %peer, "dkg bundle sent"),
                Err(e) => warn!(peer = %peer, error = %e, "dkg bundle not delivered"),
            }
        }
    }
}

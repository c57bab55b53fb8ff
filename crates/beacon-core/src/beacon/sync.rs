//! Catch-up of missing rounds from peers

use super::ChainState;
use crate::crypto::Scheme;
use crate::net::{ProtocolClient, SyncRequest};
use crate::types::NetworkId;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Everything a sync needs to fetch and check rounds
pub struct Syncer<'a> {
    pub chain: &'a ChainState,
    pub client: &'a dyn ProtocolClient,
    pub scheme: Scheme,
    /// Group public key every round verifies against
    pub public_key: Vec<u8>,
    pub beacon_id: NetworkId,
    pub timeout: Duration,
}

impl Syncer<'_> {
    /// Fetch rounds from `peers` in order until round `up_to` is stored
    #[instrument(skip(self, peers), fields(peers = peers.len()))]
    pub async fn sync(&self, peers: &[String], up_to: u64) -> Result<()> {
        for peer in peers {
            if self.chain.last_round() >= up_to {
                break;
            }
            match self.from_peer(peer, up_to).await {
                Ok(()) => debug!(peer = %peer, last = self.chain.last_round(), "sync from peer done"),
                Err(e) => warn!(peer = %peer, error = %e, "sync from peer failed"),
            }
        }

        let last = self.chain.last_round();
        if last >= up_to {
            info!(last, "chain synced");
            Ok(())
        } else {
            Err(Error::Transport(format!("sync stopped at round {}, wanted {}", last, up_to)))
        }
    }

    async fn from_peer(&self, peer: &str, up_to: u64) -> Result<()> {
        let request = SyncRequest {
            beacon_id: self.beacon_id.clone(),
            from_round: self.chain.last_round() + 1,
        };
        let mut rx = self.client.sync_chain(peer, request).await?;

        loop {
            let beacon = match tokio::time::timeout(self.timeout, rx.recv()).await {
                Ok(Some(beacon)) => beacon,
                Ok(None) => return Ok(()),
                Err(_) => return Err(Error::Transport(format!("{} silent for {:?}", peer, self.timeout))),
            };

            let last = self.chain.last()?;
            if beacon.round <= last.round {
                continue;
            }
            if beacon.round != last.round + 1 {
                return Err(Error::NonContiguousRound {
                    expected: last.round + 1,
                    got: beacon.round,
                });
            }
            if beacon.previous_signature != last.signature {
                return Err(Error::InvalidBeacon { round: beacon.round });
            }
            self.scheme
                .verify_beacon(&self.public_key, &beacon)
                .map_err(|_| Error::InvalidBeacon { round: beacon.round })?;

            let round = beacon.round;
            match self.chain.append(beacon) {
                Ok(()) => {}
                // rebuilt locally meanwhile
                Err(Error::NonContiguousRound { .. }) => continue,
                Err(e) => return Err(e),
            }
            if round >= up_to {
                return Ok(());
            }
        }
    }
}

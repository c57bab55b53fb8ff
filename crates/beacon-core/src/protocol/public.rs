//! Peer and public calls answered by one network

use super::BeaconProcess;
use crate::net::{
    async_trait, ChainInfoRequest, DkgInfoPacket, DkgPacket, HomeRequest, HomeResponse, IdentityRequest,
    PartialBeaconPacket, Peer, PublicRandRequest, PublicRandResponse, Service, SignalDkgPacket, SyncRequest,
};
use crate::types::{Beacon, ChainInfo, Identity};
use crate::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[async_trait]
impl Service for BeaconProcess {
    async fn public_rand(&self, _peer: &Peer, req: PublicRandRequest) -> Result<PublicRandResponse> {
        let chain = {
            let st = self.state.lock().await;
            if st.handler.is_none() {
                return Err(Error::BeaconNotStarted);
            }
            st.chain.clone().ok_or(Error::BeaconNotStarted)?
        };
        if req.round == 0 {
            let last = chain.last()?;
            // only the genesis entry, nothing produced yet
            if last.round == 0 {
                return Err(Error::BeaconNotStarted);
            }
            return Ok(PublicRandResponse::from(&last));
        }
        chain
            .store()
            .get(req.round)?
            .map(|b| PublicRandResponse::from(&b))
            .ok_or(Error::RoundNotFound(req.round))
    }

    async fn public_rand_stream(
        &self,
        peer: &Peer,
        req: PublicRandRequest,
        tx: mpsc::Sender<PublicRandResponse>,
    ) -> Result<()> {
        let chain = {
            let st = self.state.lock().await;
            if st.handler.is_none() {
                return Err(Error::BeaconNotStarted);
            }
            st.chain.clone().ok_or(Error::BeaconNotStarted)?
        };
        debug!(peer = %peer, from = req.round, "public stream opened");
        let key = format!("public:{}", peer);
        chain.follow(&key, req.round, &tx, |b| PublicRandResponse::from(b)).await?;
        debug!(peer = %peer, "public stream closed");
        Ok(())
    }

    async fn chain_info(&self, _peer: &Peer, _req: ChainInfoRequest) -> Result<ChainInfo> {
        let st = self.state.lock().await;
        let group = st.group.as_ref().ok_or(Error::NoGroup)?;
        ChainInfo::new(group, self.scheme())
    }

    async fn home(&self, peer: &Peer, _req: HomeRequest) -> Result<HomeResponse> {
        info!(peer = %peer, "home request");
        Ok(HomeResponse {
            status: format!("beacon node up and running on {}", self.identity().address),
        })
    }

    async fn partial_beacon(&self, _peer: &Peer, packet: PartialBeaconPacket) -> Result<()> {
        let handler = self.state.lock().await.handler.clone();
        handler.ok_or(Error::BeaconNotStarted)?.process_partial(packet)
    }

    async fn broadcast_dkg(&self, peer: &Peer, packet: DkgPacket) -> Result<()> {
        let intake = {
            let mut st = self.state.lock().await;
            let session = st.dkg.as_mut().ok_or(Error::NoDkgRunning)?;
            if session.start() {
                info!(peer = %peer, "dkg started by first packet");
            }
            session.intake()
        };
        intake
            .send(packet.bundle)
            .await
            .map_err(|_| Error::Dkg("dkg session closed".into()))
    }

    async fn signal_dkg_participant(&self, _peer: &Peer, packet: SignalDkgPacket) -> Result<()> {
        let manager = self.state.lock().await.manager.clone();
        manager.ok_or(Error::NoSetupManager)?.received_key(&packet)
    }

    async fn push_dkg_info(&self, peer: &Peer, packet: DkgInfoPacket) -> Result<()> {
        debug!(peer = %peer, nodes = packet.new_group.len(), "dkg info received");
        self.accept_info(packet).await
    }

    async fn sync_chain(&self, peer: &Peer, req: SyncRequest, tx: mpsc::Sender<Beacon>) -> Result<()> {
        let chain = self.state.lock().await.chain.clone();
        let Some(chain) = chain else {
            debug!(peer = %peer, "sync request with no chain");
            return Ok(());
        };
        let key = format!("sync:{}", peer);
        chain.follow(&key, req.from_round.max(1), &tx, Beacon::clone).await
    }

    async fn get_identity(&self, _peer: &Peer, _req: IdentityRequest) -> Result<Identity> {
        Ok(self.identity().clone())
    }
}

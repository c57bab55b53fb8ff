//! One beacon network: setup, beacon generation and resharing
//!
//! All state transitions go through a single async mutex. Waits that
//! depend on other nodes (setup handshake, DKG completion) happen with the
//! lock released so that the calls feeding them can get through.

use super::{LeaderParams, Lifecycle, Protocol, ProtocolConfig, SetupRole};
use crate::beacon::{ChainState, Handler, HandlerConfig};
use crate::chain::{round_at_or_after, time_of_round, FileChainStore};
use crate::crypto::Scheme;
use crate::dkg::{secret_proof, Broadcaster, DkgConfig, DkgSession, SetupManager, SetupReceiver};
use crate::key::FileStore;
use crate::net::{async_trait, DkgInfoPacket, SignalDkgPacket};
use crate::types::{Group, Identity, NetworkId, Share};
use crate::{Error, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Attempts at reaching the setup leader before giving up
const SIGNAL_ATTEMPTS: usize = 50;
const SIGNAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Default)]
pub(super) struct State {
    pub(super) group: Option<Group>,
    pub(super) share: Option<Share>,
    pub(super) store: Option<FileStore>,
    pub(super) chain: Option<Arc<ChainState>>,
    pub(super) handler: Option<Handler>,
    pub(super) dkg: Option<DkgSession>,
    pub(super) manager: Option<Arc<SetupManager>>,
    pub(super) receiver: Option<Arc<SetupReceiver>>,
    /// Time a scheduled hand over to a reshared group happens
    pub(super) transition_time: Option<i64>,
    pub(super) terminated: bool,
}

impl State {
    fn setup_running(&self) -> bool {
        self.dkg.is_some() || self.manager.is_some() || self.receiver.is_some()
    }
}

/// Protocol instance shared by every registered version; the version
/// only decides the beacon scheme
pub struct BeaconProcess {
    version: &'static str,
    scheme: Scheme,
    pub(super) config: ProtocolConfig,
    legacy: bool,
    id: RwLock<Option<NetworkId>>,
    target: RwLock<Option<NetworkId>>,
    pub(super) state: Mutex<State>,
}

impl BeaconProcess {
    /// Instance with no group, ready to take part in a setup
    pub fn fresh(version: &'static str, scheme: Scheme, config: ProtocolConfig) -> Self {
        Self {
            version,
            scheme,
            config,
            legacy: false,
            id: RwLock::new(None),
            target: RwLock::new(None),
            state: Mutex::new(State::default()),
        }
    }

    /// Restore the network persisted in `folder`; beacon generation is
    /// left stopped
    pub fn load(
        version: &'static str,
        scheme: Scheme,
        config: ProtocolConfig,
        folder: &Path,
        legacy: bool,
    ) -> Result<Self> {
        let identity = config.keypair.identity();
        if let Err(e) = identity.valid_signature() {
            error!(
                address = %identity.address,
                error = %e,
                "INVALID SELF SIGNATURE on the node key, other nodes will reject it"
            );
        }

        let store = FileStore::new(folder);
        let share = store.load_share()?;
        let mut group = store.load_group()?;
        if group.public_key.is_none() {
            warn!(folder = ?folder, "stored group has no public key, deriving it from the share");
            group.public_key = Some(share.public());
        }
        if !group.contains(identity) {
            return Err(Error::NotInGroup(identity.address.clone()));
        }
        let chain = open_chain(&store, &group, &config)?;
        let id = group.id();
        info!(
            network = %id,
            version,
            legacy,
            last_round = chain.last_round(),
            "network loaded"
        );

        Ok(Self {
            version,
            scheme,
            config,
            legacy,
            id: RwLock::new(Some(id)),
            target: RwLock::new(None),
            state: Mutex::new(State {
                group: Some(group),
                share: Some(share),
                store: Some(store),
                chain: Some(chain),
                ..State::default()
            }),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub(super) fn identity(&self) -> &Identity {
        self.config.keypair.identity()
    }

    /// Identifier written on outgoing messages; empty for the legacy network
    fn outgoing_id(&self, group: &Group) -> NetworkId {
        if self.legacy {
            NetworkId::empty()
        } else {
            group.id()
        }
    }

    fn new_handler(&self, st: &State) -> Result<Handler> {
        let group = st.group.clone().ok_or(Error::NoGroup)?;
        if !group.contains(self.identity()) {
            return Err(Error::NotInGroup(self.identity().address.clone()));
        }
        let share = st.share.clone().ok_or(Error::NoGroup)?;
        let chain = st.chain.clone().ok_or(Error::NoGroup)?;
        Handler::new(
            HandlerConfig {
                scheme: self.scheme,
                beacon_id: self.outgoing_id(&group),
                own: self.identity().clone(),
                config: self.config.beacon.clone(),
            },
            chain,
            self.config.client.clone(),
            self.config.clock.clone(),
            group,
            share,
        )
    }

    /// Folder and chain of `group`, created on first use
    fn ensure_store(&self, st: &mut State, group: &Group) -> Result<FileStore> {
        let store = match &st.store {
            Some(store) => store.clone(),
            None => {
                let store = FileStore::new(self.config.networks_dir.join(group.id().to_hex()));
                store.save_version(self.version)?;
                st.store = Some(store.clone());
                store
            }
        };
        if st.chain.is_none() {
            st.chain = Some(open_chain(&store, group, &self.config)?);
        }
        Ok(store)
    }

    /// Create the DKG session negotiating `target`
    pub(super) fn open_session(
        &self,
        st: &mut State,
        target: Group,
        old: Option<Group>,
        timeout: Duration,
    ) -> Result<()> {
        if st.dkg.is_some() {
            return Err(Error::SetupInProgress);
        }
        let (old_nodes, old_threshold, old_public, share) = match &old {
            Some(old) => (
                old.nodes.clone(),
                old.threshold,
                Some(old.public_key()?.clone()),
                st.share.clone().filter(|_| old.contains(self.identity())),
            ),
            None => (Vec::new(), 0, None, None),
        };
        let config = DkgConfig {
            longterm: self.config.keypair.secret()?,
            own: self.identity().clone(),
            new_nodes: target.nodes.clone(),
            threshold: target.threshold,
            old_nodes,
            old_threshold,
            old_public,
            share,
            nonce: target.hash(),
            timeout,
        };
        let board = Arc::new(Broadcaster::new(
            self.config.client.clone(),
            self.outgoing_id(old.as_ref().unwrap_or(&target)),
            config.peers(),
        ));
        let id = target.id();
        st.dkg = Some(DkgSession::new(target, old, config, board)?);
        *self.target.write() = Some(id.clone());
        info!(network = %id, "dkg session opened");
        Ok(())
    }

    /// Drop whatever a failed setup left behind
    async fn abandon_setup(&self) {
        let mut st = self.state.lock().await;
        st.manager = None;
        st.receiver = None;
        st.dkg = None;
        *self.target.write() = None;
    }

    fn dkg_timeout(&self, secs: u64) -> Duration {
        if secs == 0 {
            self.config.beacon.dkg_timeout
        } else {
            Duration::from_secs(secs)
        }
    }

    /// Leader side of the handshake: gather `params.nodes` identities
    async fn gather(&self, params: &LeaderParams, secret: &[u8]) -> Result<Vec<Identity>> {
        if params.threshold == 0 || params.threshold > params.nodes {
            return Err(Error::Dkg(format!(
                "threshold {} invalid for {} nodes",
                params.threshold, params.nodes
            )));
        }
        let done = {
            let mut st = self.state.lock().await;
            if st.setup_running() {
                return Err(Error::SetupInProgress);
            }
            let (manager, done) = SetupManager::new(self.identity().clone(), params.nodes, secret);
            st.manager = Some(manager);
            done
        };
        info!(expected = params.nodes, "waiting for participants");
        let identities = done
            .await
            .map_err(|_| Error::Dkg("setup abandoned".into()))?;
        self.state.lock().await.manager = None;
        Ok(identities)
    }

    /// Participant side of the handshake: announce ourselves (unless
    /// leaving) and wait for the leader's group
    async fn join(
        &self,
        leader: &str,
        beacon_id: NetworkId,
        secret: &[u8],
        signal: bool,
    ) -> Result<DkgInfoPacket> {
        let rx: oneshot::Receiver<DkgInfoPacket> = {
            let mut st = self.state.lock().await;
            if st.setup_running() {
                return Err(Error::SetupInProgress);
            }
            let (receiver, rx) = SetupReceiver::new(secret);
            st.receiver = Some(receiver);
            rx
        };
        if signal {
            self.signal_leader(leader, beacon_id, secret).await?;
        }
        let info = rx
            .await
            .map_err(|_| Error::Dkg("setup abandoned".into()))?;
        self.state.lock().await.receiver = None;
        Ok(info)
    }

    async fn signal_leader(&self, leader: &str, beacon_id: NetworkId, secret: &[u8]) -> Result<()> {
        let packet = SignalDkgPacket {
            beacon_id,
            node: self.identity().clone(),
            secret_proof: secret_proof(secret),
        };
        let mut attempt = 1;
        loop {
            match self.config.client.signal_dkg_participant(leader, packet.clone()).await {
                Ok(()) => {
                    info!(leader, "signaled setup leader");
                    return Ok(());
                }
                Err(Error::InvalidSecret) => return Err(Error::InvalidSecret),
                Err(e) if attempt < SIGNAL_ATTEMPTS => {
                    debug!(leader, attempt, error = %e, "leader not ready");
                    attempt += 1;
                    tokio::time::sleep(SIGNAL_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send the negotiated group to every other participant
    async fn push_info(&self, info: DkgInfoPacket) {
        let own = self.identity().key.clone();
        let mut peers: Vec<String> = info
            .new_group
            .nodes
            .iter()
            .chain(info.old_group.iter().flat_map(|g| g.nodes.iter()))
            .filter(|n| n.identity.key != own)
            .map(|n| n.address().to_string())
            .collect();
        peers.sort();
        peers.dedup();

        let client = &self.config.client;
        let pushes = peers.iter().map(|peer| {
            let info = info.clone();
            async move { (peer, client.push_dkg_info(peer, info).await) }
        });
        for (peer, result) in join_all(pushes).await {
            match result {
                Ok(()) => debug!(peer = %peer, "dkg info pushed"),
                Err(e) => warn!(peer = %peer, error = %e, "dkg info not delivered"),
            }
        }
    }

    async fn start_session(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let session = st.dkg.as_mut().ok_or(Error::NoDkgRunning)?;
        if session.start() {
            info!("dkg started");
        }
        Ok(())
    }

    /// An old member hands over through its running beacon
    fn check_handover(&self, st: &State, old: &Group) -> Result<()> {
        if old.contains(self.identity()) && st.handler.is_none() {
            return Err(Error::BeaconNotStarted);
        }
        Ok(())
    }

    /// Wait for the running DKG and adopt its outcome, handing over from
    /// `old` when resharing.
    ///
    /// The group keeps only the qualified holders. A holder persists its
    /// share, then the group. A node leaving through a resharing gets no
    /// share and keeps its current group until the transition. Nothing is
    /// persisted when the handover cannot happen.
    #[instrument(skip(self, old))]
    async fn wait_dkg(&self, old: Option<&Group>) -> Result<Group> {
        let done = {
            let mut st = self.state.lock().await;
            st.dkg.as_mut().ok_or(Error::NoDkgRunning)?.take_done()?
        };
        let outcome = done.await;

        let mut st = self.state.lock().await;
        let session = st.dkg.take().ok_or(Error::NoDkgRunning)?;
        *self.target.write() = None;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "dkg failed");
                return Err(e);
            }
            Err(_) => return Err(Error::Dkg("dkg session abandoned".into())),
        };

        let mut group = session.target.clone();
        group.nodes.retain(|n| result.qual.contains(&n.index));
        info!(
            qualified = group.len(),
            invited = session.target.len(),
            "dkg finished"
        );
        if let Some(old) = old {
            self.check_handover(&st, old)?;
        }

        match result.share {
            Some(share) => {
                group.public_key = Some(share.public());
                let store = self.ensure_store(&mut st, &group)?;
                store.save_share(&share)?;
                store.save_group(&group)?;
                st.share = Some(share);
                st.group = Some(group.clone());
                *self.id.write() = Some(group.id());
            }
            None => {
                let leaving = session
                    .old
                    .as_ref()
                    .is_some_and(|old| old.contains(self.identity()))
                    && !session.target.contains(self.identity());
                if !leaving {
                    return Err(Error::NotInGroup(self.identity().address.clone()));
                }
                group.public_key = session.old.as_ref().and_then(|old| old.public_key.clone());
                info!("no share in the new group, leaving at transition");
            }
        }
        if let Some(old) = old {
            self.transition(&mut st, old, &group)?;
        }
        Ok(group)
    }

    /// Hand over from `old` to the freshly reshared `new` group
    fn transition(&self, st: &mut State, old: &Group, new: &Group) -> Result<()> {
        let own = self.identity();
        match (old.contains(own), new.contains(own)) {
            (true, false) => {
                let handler = st.handler.clone().ok_or(Error::BeaconNotStarted)?;
                handler.stop_at(new.transition_time - 1);
                info!(transition_time = new.transition_time, "leaving network at transition");
            }
            (true, true) => {
                let handler = st.handler.clone().ok_or(Error::BeaconNotStarted)?;
                let share = st.share.clone().ok_or(Error::NoGroup)?;
                handler.transition_new_group(share, new.clone())?;
            }
            (false, true) => {
                let handler = self.new_handler(st)?;
                handler.transition(old);
                st.handler = Some(handler);
            }
            (false, false) => return Err(Error::NotInGroup(own.address.clone())),
        }
        st.transition_time = Some(new.transition_time);
        Ok(())
    }

    #[instrument(skip(self, secret))]
    async fn run_setup(&self, role: SetupRole, secret: &[u8]) -> Result<Group> {
        if self.state.lock().await.group.is_some() {
            return Err(Error::SetupInProgress);
        }
        match role {
            SetupRole::Leader(params) => {
                if params.period == 0 {
                    return Err(Error::Dkg("period must be positive".into()));
                }
                let identities = self.gather(&params, secret).await?;
                let genesis = self.config.clock.now() + params.delay as i64;
                let group = Group::new(identities, params.threshold, params.period, genesis);
                let timeout = self.dkg_timeout(params.dkg_timeout);
                let info = DkgInfoPacket {
                    beacon_id: group.id(),
                    new_group: group.clone(),
                    old_group: None,
                    secret_proof: secret_proof(secret),
                    dkg_timeout: timeout.as_secs(),
                };
                {
                    let mut st = self.state.lock().await;
                    self.open_session(&mut st, group, None, timeout)?;
                }
                self.push_info(info).await;
                self.start_session().await?;
            }
            SetupRole::Participant { leader, .. } => {
                self.join(&leader, NetworkId::empty(), secret, true).await?;
            }
        }
        self.wait_dkg(None).await
    }

    #[instrument(skip(self, secret), fields(network = %target))]
    async fn run_reshare(&self, role: SetupRole, secret: &[u8], target: NetworkId) -> Result<Group> {
        let current = {
            let st = self.state.lock().await;
            if let Some(current) = &st.group {
                if current.id() != target {
                    return Err(Error::UnknownNetwork(target));
                }
                self.check_handover(&st, current)?;
            }
            st.group.clone()
        };
        *self.target.write() = Some(target.clone());

        let old = match role {
            SetupRole::Leader(params) => {
                let old = current.ok_or(Error::NoGroup)?;
                let identities = self.gather(&params, secret).await?;
                let at = self.config.clock.now() + params.delay as i64;
                let transition_time = time_of_round(
                    old.period,
                    old.genesis_time,
                    round_at_or_after(at, old.period, old.genesis_time),
                );
                let group = Group::new_reshare(&old, identities, params.threshold, transition_time);
                let timeout = self.dkg_timeout(params.dkg_timeout);
                let info = DkgInfoPacket {
                    beacon_id: self.outgoing_id(&old),
                    new_group: group.clone(),
                    old_group: Some(old.clone()),
                    secret_proof: secret_proof(secret),
                    dkg_timeout: timeout.as_secs(),
                };
                info!(transition_time, nodes = group.len(), "resharing group");
                {
                    let mut st = self.state.lock().await;
                    self.open_session(&mut st, group, Some(old.clone()), timeout)?;
                }
                self.push_info(info).await;
                self.start_session().await?;
                old
            }
            SetupRole::Participant { leader, leaving } => {
                let beacon_id = if self.legacy { NetworkId::empty() } else { target.clone() };
                let info = self.join(&leader, beacon_id, secret, !leaving).await?;
                info.old_group
                    .ok_or_else(|| Error::Dkg("resharing info carries no old group".into()))?
            }
        };

        self.wait_dkg(Some(&old)).await
    }

    /// Take the pushed group of a setup this node waits for, opening its
    /// DKG session before answering
    pub(super) async fn accept_info(&self, packet: DkgInfoPacket) -> Result<()> {
        let mut st = self.state.lock().await;
        let receiver = st.receiver.clone().ok_or(Error::NoSetupReceiver)?;
        receiver.verify(&packet)?;

        let own = self.identity();
        let in_old = packet.old_group.as_ref().is_some_and(|g| g.contains(own));
        if !packet.new_group.contains(own) && !in_old {
            return Err(Error::NotInGroup(own.address.clone()));
        }
        if let (Some(current), Some(old)) = (&st.group, &packet.old_group) {
            if current.id() != old.id() {
                return Err(Error::UnknownNetwork(old.id()));
            }
        }

        let timeout = self.dkg_timeout(packet.dkg_timeout);
        self.open_session(&mut st, packet.new_group.clone(), packet.old_group.clone(), timeout)?;
        receiver.deliver(packet)
    }

    pub(super) fn lifecycle_of(&self, st: &State) -> Lifecycle {
        if st.terminated {
            return Lifecycle::Terminated;
        }
        if st.setup_running() {
            return if st.group.is_some() {
                Lifecycle::TransitionInProgress
            } else {
                Lifecycle::DkgInProgress
            };
        }
        if st
            .transition_time
            .is_some_and(|t| self.config.clock.now() < t)
        {
            return Lifecycle::TransitionInProgress;
        }
        match &st.group {
            Some(_) => Lifecycle::Established {
                beacon_running: st.handler.as_ref().is_some_and(Handler::is_running),
            },
            None => Lifecycle::Unestablished,
        }
    }
}

fn open_chain(store: &FileStore, group: &Group, config: &ProtocolConfig) -> Result<Arc<ChainState>> {
    let db = FileChainStore::open(store.beacon_path())?;
    Ok(Arc::new(ChainState::open(
        Arc::new(db),
        &group.genesis_seed,
        config.beacon.stream_buffer,
    )?))
}

#[async_trait]
impl Protocol for BeaconProcess {
    fn version(&self) -> &str {
        self.version
    }

    fn id(&self) -> Option<NetworkId> {
        self.id.read().clone()
    }

    fn target_id(&self) -> Option<NetworkId> {
        self.target.read().clone()
    }

    fn is_legacy(&self) -> bool {
        self.legacy
    }

    async fn lifecycle(&self) -> Lifecycle {
        let st = self.state.lock().await;
        self.lifecycle_of(&st)
    }

    async fn group(&self) -> Option<Group> {
        self.state.lock().await.group.clone()
    }

    async fn chain(&self) -> Option<Arc<ChainState>> {
        self.state.lock().await.chain.clone()
    }

    async fn setup(&self, role: SetupRole, secret: &[u8]) -> Result<Group> {
        let result = self.run_setup(role, secret).await;
        if result.as_ref().is_err_and(|e| !matches!(e, Error::SetupInProgress)) {
            self.abandon_setup().await;
        }
        result
    }

    async fn reshare(&self, role: SetupRole, secret: &[u8], target: NetworkId) -> Result<Group> {
        let result = self.run_reshare(role, secret, target).await;
        if result
            .as_ref()
            .is_err_and(|e| !matches!(e, Error::SetupInProgress | Error::BeaconNotStarted))
        {
            self.abandon_setup().await;
        }
        result
    }

    async fn start_beacon(&self, catchup: bool) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.terminated {
            return Err(Error::Terminated);
        }
        if st.handler.as_ref().is_some_and(Handler::is_running) {
            debug!("beacon already running");
            return Ok(());
        }
        let handler = match st.handler.clone() {
            Some(handler) => handler,
            None => self.new_handler(&st)?,
        };
        if catchup {
            handler.catchup();
        } else {
            handler.start();
        }
        st.handler = Some(handler);
        Ok(())
    }

    async fn stop_beacon(&self) {
        let mut st = self.state.lock().await;
        if let Some(handler) = st.handler.take() {
            handler.stop().await;
        }
    }

    async fn terminate(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(handler) = st.handler.take() {
            handler.stop().await;
        }
        st.dkg = None;
        st.manager = None;
        st.receiver = None;
        if let Some(chain) = st.chain.take() {
            chain.store().destroy()?;
        }
        if let Some(store) = st.store.take() {
            store.destroy()?;
        }
        st.group = None;
        st.share = None;
        st.transition_time = None;
        st.terminated = true;
        *self.target.write() = None;
        info!(network = ?self.id(), "network terminated");
        Ok(())
    }

    async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        if let Some(handler) = st.handler.take() {
            handler.stop().await;
        }
        st.dkg = None;
        st.manager = None;
        st.receiver = None;
        debug!(network = ?self.id(), "network shut down");
    }

    async fn describe(&self) -> String {
        let st = self.state.lock().await;
        let lifecycle = self.lifecycle_of(&st);
        let id = match (self.id(), self.target_id()) {
            (Some(id), _) => id.to_hex(),
            (None, Some(target)) => format!("setup of {}", target.to_hex()),
            (None, None) => "setup".to_string(),
        };
        let mut line = format!("{} {}{} [{}]", id, self.version, if self.legacy { " legacy" } else { "" }, lifecycle);
        if let Some(group) = &st.group {
            line.push_str(&format!(
                " nodes={} threshold={} period={}s",
                group.len(),
                group.threshold,
                group.period
            ));
        }
        if let Some(chain) = &st.chain {
            line.push_str(&format!(" last_round={}", chain.last_round()));
        }
        line
    }
}

//! Dispatch server: every network this node runs behind one surface
//!
//! Inbound calls are routed by their `beacon_id`. An empty identifier
//! targets the legacy network when one is loaded. Setup calls may also
//! target the single instance currently being set up, which has no
//! identifier of its own yet.

use crate::key::FileStore;
use crate::net::{
    async_trait, ChainInfoRequest, DkgInfoPacket, DkgPacket, HomeRequest, HomeResponse, IdentityRequest,
    PartialBeaconPacket, Peer, PublicRandRequest, PublicRandResponse, Service, SignalDkgPacket, SyncRequest,
};
use crate::protocol::{Factory, Protocol, ProtocolConfig, Registry, SetupRole, V1, V2};
use crate::types::{Beacon, ChainInfo, Group, Identity, NetworkId};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

/// Start a fresh network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRequest {
    pub version: String,
    pub role: SetupRole,
    pub secret: String,
}

/// Reshare a running network, or join one as a new member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareRequest {
    #[serde(default)]
    pub id: NetworkId,
    pub role: SetupRole,
    pub secret: String,
    /// Version of the network, needed only when joining
    #[serde(default)]
    pub version: Option<String>,
}

/// Outcome of loading the persisted networks
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<NetworkId>,
    /// Folder name and reason, one entry per folder that failed
    pub errors: Vec<(String, Error)>,
}

impl LoadReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Registry of the networks run by this node
pub struct Server {
    registry: Registry,
    config: ProtocolConfig,
    instances: RwLock<HashMap<NetworkId, Arc<dyn Protocol>>>,
    /// Instance going through a setup, not registered yet
    setup: RwLock<Option<Arc<dyn Protocol>>>,
    /// Network answering calls that carry no identifier
    alias: RwLock<Option<NetworkId>>,
}

impl Server {
    pub fn new(registry: Registry, config: ProtocolConfig) -> Self {
        Self {
            registry,
            config,
            instances: RwLock::new(HashMap::new()),
            setup: RwLock::new(None),
            alias: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn identity(&self) -> &Identity {
        self.config.keypair.identity()
    }

    /// Restore every network folder found on disk.
    ///
    /// A folder that fails is reported and skipped; the others load.
    /// Beacons are not started.
    pub fn load_instances(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let dir = &self.config.networks_dir;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                report.errors.push((dir.display().to_string(), e.into()));
                return report;
            }
        };
        let mut folders: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        folders.sort();

        for folder in folders {
            let name = folder
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match self.load_one(&folder, &name) {
                Ok(id) => report.loaded.push(id),
                Err(e) => {
                    error!(folder = %name, error = %e, "network failed to load");
                    report.errors.push((name, e));
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.errors.len(),
            "networks loaded"
        );
        report
    }

    fn load_one(&self, folder: &Path, name: &str) -> Result<NetworkId> {
        let (version, legacy) = match FileStore::new(folder).load_version()? {
            Some(version) => (version, false),
            None => {
                if self.alias.read().is_some() {
                    return Err(Error::DuplicateLegacyInstance(name.to_string()));
                }
                (V1.to_string(), true)
            }
        };
        let factory = self.registry.lookup(&version)?;
        let instance = (factory.load)(self.config.clone(), folder, legacy)?;
        let id = instance
            .id()
            .ok_or_else(|| Error::Internal(format!("network in {} has no identifier", name)))?;
        if !legacy && NetworkId::from_hex(name)? != id {
            return Err(Error::Storage(format!("folder {} holds network {}", name, id)));
        }

        let mut instances = self.instances.write();
        if instances.contains_key(&id) {
            return Err(Error::Storage(format!("network {} loaded twice", id)));
        }
        instances.insert(id.clone(), instance);
        if legacy {
            *self.alias.write() = Some(id.clone());
            info!(network = %id, folder = %name, "legacy network registered as alias");
        }
        Ok(id)
    }

    /// Start the beacon of every registered network
    pub async fn start_all(&self, catchup: bool) {
        for (id, instance) in self.snapshot() {
            if let Err(e) = instance.start_beacon(catchup).await {
                warn!(network = %id, error = %e, "beacon not started");
            }
        }
    }

    /// Identifiers of the registered networks, sorted
    pub fn ids(&self) -> Vec<NetworkId> {
        let mut ids: Vec<_> = self.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn instance(&self, id: &NetworkId) -> Option<Arc<dyn Protocol>> {
        self.instances.read().get(id).cloned()
    }

    pub fn alias(&self) -> Option<NetworkId> {
        self.alias.read().clone()
    }

    fn snapshot(&self) -> Vec<(NetworkId, Arc<dyn Protocol>)> {
        let mut all: Vec<_> = self
            .instances
            .read()
            .iter()
            .map(|(id, instance)| (id.clone(), instance.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Instance answering calls for `id`
    pub fn route(&self, id: &NetworkId) -> Result<Arc<dyn Protocol>> {
        let id = if id.is_empty() {
            self.alias.read().clone().ok_or(Error::MissingIdentifier)?
        } else {
            id.clone()
        };
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownNetwork(id))
    }

    /// Like [`Server::route`], falling back to the instance in setup.
    /// `accept_untargeted` lets a setup that has no target yet take the
    /// call. An empty identifier goes to the legacy network while it
    /// reshares, to the setup otherwise.
    fn route_setup(&self, id: &NetworkId, accept_untargeted: bool) -> Result<Arc<dyn Protocol>> {
        let setup = self.setup.read().clone();
        if id.is_empty() {
            let resharing = self
                .alias()
                .and_then(|alias| self.instance(&alias))
                .filter(|legacy| legacy.target_id().is_some());
            if let Some(legacy) = resharing {
                return Ok(legacy);
            }
            return match setup {
                Some(setup) => Ok(setup),
                None => self.route(id),
            };
        }
        if let Some(instance) = self.instance(id) {
            return Ok(instance);
        }
        if let Some(setup) = setup {
            match setup.target_id() {
                Some(target) if &target == id => return Ok(setup),
                None if accept_untargeted => return Ok(setup),
                _ => {}
            }
        }
        Err(Error::UnknownNetwork(id.clone()))
    }

    fn claim_setup(&self, factory: Factory) -> Result<Arc<dyn Protocol>> {
        let mut slot = self.setup.write();
        if slot.is_some() {
            return Err(Error::SetupInProgress);
        }
        let instance = (factory.fresh)(self.config.clone())?;
        *slot = Some(instance.clone());
        Ok(instance)
    }

    /// Register the instance of a completed setup, then free the slot
    async fn finish_setup(&self, instance: Arc<dyn Protocol>, outcome: Result<Group>) -> Result<Group> {
        let group = match outcome {
            Ok(group) => group,
            Err(e) => {
                self.setup.write().take();
                instance.shutdown().await;
                return Err(e);
            }
        };
        let id = group.id();
        self.instances.write().insert(id.clone(), instance);
        self.setup.write().take();
        info!(network = %id, nodes = group.len(), "network registered");
        Ok(group)
    }

    /// Run the setup of a new network and start its beacon
    #[instrument(skip(self, req), fields(version = %req.version))]
    pub async fn setup(&self, req: SetupRequest) -> Result<Group> {
        let factory = self.registry.lookup(&req.version)?;
        let instance = self.claim_setup(factory)?;
        let outcome = instance.setup(req.role, req.secret.as_bytes()).await;
        let group = self.finish_setup(instance.clone(), outcome).await?;
        instance.start_beacon(false).await?;
        Ok(group)
    }

    /// Reshare the network `req.id`; a node running no such network joins
    /// it as a new member
    #[instrument(skip(self, req), fields(network = %req.id))]
    pub async fn reshare(&self, req: ReshareRequest) -> Result<Group> {
        match self.route(&req.id) {
            Ok(instance) => {
                let target = instance.id().ok_or(Error::NoGroup)?;
                instance.reshare(req.role, req.secret.as_bytes(), target).await
            }
            Err(Error::UnknownNetwork(id)) => {
                let version = req.version.as_deref().unwrap_or(V2);
                let factory = self.registry.lookup(version)?;
                let instance = self.claim_setup(factory)?;
                info!(network = %id, version, "joining network");
                let outcome = instance.reshare(req.role, req.secret.as_bytes(), id).await;
                self.finish_setup(instance, outcome).await
            }
            Err(e) => Err(e),
        }
    }

    /// Stop a network and delete everything it persisted
    pub async fn terminate(&self, id: &NetworkId) -> Result<()> {
        let instance = self.route(id)?;
        instance.terminate().await?;
        let id = instance.id().unwrap_or_else(|| id.clone());
        self.instances.write().remove(&id);
        let mut alias = self.alias.write();
        if alias.as_ref() == Some(&id) {
            *alias = None;
        }
        info!(network = %id, "network removed");
        Ok(())
    }

    /// Stop every network, keeping their data
    pub async fn shutdown(&self) {
        for (id, instance) in self.snapshot() {
            instance.shutdown().await;
            info!(network = %id, "network stopped");
        }
        let setup = self.setup.write().take();
        if let Some(setup) = setup {
            setup.shutdown().await;
        }
    }

    /// One line per network, plus one for a running setup
    pub async fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (_, instance) in self.snapshot() {
            lines.push(instance.describe().await);
        }
        let setup = self.setup.read().clone();
        if let Some(setup) = setup {
            lines.push(format!("setup in progress: {}", setup.describe().await));
        }
        lines
    }
}

#[async_trait]
impl Service for Server {
    async fn public_rand(&self, peer: &Peer, req: PublicRandRequest) -> Result<PublicRandResponse> {
        self.route(&req.beacon_id)?.public_rand(peer, req).await
    }

    async fn public_rand_stream(
        &self,
        peer: &Peer,
        req: PublicRandRequest,
        tx: mpsc::Sender<PublicRandResponse>,
    ) -> Result<()> {
        self.route(&req.beacon_id)?.public_rand_stream(peer, req, tx).await
    }

    async fn chain_info(&self, peer: &Peer, req: ChainInfoRequest) -> Result<ChainInfo> {
        self.route(&req.beacon_id)?.chain_info(peer, req).await
    }

    async fn home(&self, peer: &Peer, req: HomeRequest) -> Result<HomeResponse> {
        match self.route(&req.beacon_id) {
            Ok(instance) => instance.home(peer, req).await,
            Err(Error::MissingIdentifier) => Ok(HomeResponse {
                status: format!(
                    "beacon node up and running on {} with {} networks",
                    self.identity().address,
                    self.instances.read().len()
                ),
            }),
            Err(e) => Err(e),
        }
    }

    async fn partial_beacon(&self, peer: &Peer, packet: PartialBeaconPacket) -> Result<()> {
        self.route(&packet.beacon_id)?.partial_beacon(peer, packet).await
    }

    async fn broadcast_dkg(&self, peer: &Peer, packet: DkgPacket) -> Result<()> {
        self.route_setup(&packet.beacon_id, false)?
            .broadcast_dkg(peer, packet)
            .await
    }

    async fn signal_dkg_participant(&self, peer: &Peer, packet: SignalDkgPacket) -> Result<()> {
        self.route_setup(&packet.beacon_id, false)?
            .signal_dkg_participant(peer, packet)
            .await
    }

    async fn push_dkg_info(&self, peer: &Peer, packet: DkgInfoPacket) -> Result<()> {
        self.route_setup(&packet.beacon_id, true)?
            .push_dkg_info(peer, packet)
            .await
    }

    async fn sync_chain(&self, peer: &Peer, req: SyncRequest, tx: mpsc::Sender<Beacon>) -> Result<()> {
        self.route(&req.beacon_id)?.sync_chain(peer, req, tx).await
    }

    async fn get_identity(&self, _peer: &Peer, _req: IdentityRequest) -> Result<Identity> {
        Ok(self.identity().clone())
    }
}

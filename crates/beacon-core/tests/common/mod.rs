//! Multi-node harness: servers on an in-memory network driven by one
//! manual clock

#![allow(dead_code)]

use beacon_core::clock::{Clock, ManualClock};
use beacon_core::config::BeaconConfig;
use beacon_core::crypto;
use beacon_core::key::{FileStore, KeyPair};
use beacon_core::net::{MemoryNetwork, Peer, ProtocolClient};
use beacon_core::protocol::{LeaderParams, ProtocolConfig, Registry, SetupRole};
use beacon_core::types::{DistPublic, Group, NetworkId, Share};
use beacon_core::{Server, SetupRequest};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const START: i64 = 1_700_000_000;
pub const PERIOD: u64 = 10;
pub const SECRET: &str = "correct horse battery staple";
pub const WAIT: Duration = Duration::from_secs(20);

pub fn beacon_config() -> BeaconConfig {
    BeaconConfig {
        dkg_timeout: Duration::from_secs(3),
        catchup_period: Duration::from_millis(20),
        sync_timeout: Duration::from_millis(500),
        ..BeaconConfig::default()
    }
}

pub fn peer() -> Peer {
    Peer::new("tester")
}

pub fn keypair(address: &str, seed: u64) -> KeyPair {
    KeyPair::generate(address, &mut ChaCha20Rng::seed_from_u64(seed))
}

pub struct TestNode {
    pub address: String,
    pub keypair: Arc<KeyPair>,
    pub root: PathBuf,
    pub server: Arc<Server>,
}

impl TestNode {
    pub fn networks_dir(&self) -> PathBuf {
        self.root.join("networks")
    }
}

pub struct Cluster {
    pub network: MemoryNetwork,
    pub clock: Arc<ManualClock>,
    pub nodes: Vec<TestNode>,
    pub config: BeaconConfig,
    dir: TempDir,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, beacon_config())
    }

    pub fn with_config(size: usize, config: BeaconConfig) -> Self {
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            clock: Arc::new(ManualClock::new(START)),
            nodes: Vec::new(),
            config,
            dir: tempfile::tempdir().unwrap(),
        };
        for _ in 0..size {
            cluster.add_node();
        }
        cluster
    }

    /// Add a node named `node-<i>` and put it on the network
    pub fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let address = format!("node-{}", index);
        let keypair = Arc::new(keypair(&address, index as u64));
        let root = self.dir.path().join(&address);
        let server = Arc::new(self.server_at(&address, keypair.clone(), &root));
        self.network.register(&address, server.clone());
        self.nodes.push(TestNode {
            address,
            keypair,
            root,
            server,
        });
        index
    }

    /// A new server for an existing node, e.g. to simulate a restart
    pub fn server_at(&self, address: &str, keypair: Arc<KeyPair>, root: &Path) -> Server {
        let client: Arc<dyn ProtocolClient> = self.network.client(address);
        let clock: Arc<dyn Clock> = self.clock.clone();
        Server::new(
            Registry::standard(),
            ProtocolConfig {
                keypair,
                client,
                clock,
                beacon: self.config.clone(),
                networks_dir: root.join("networks"),
            },
        )
    }

    pub fn server(&self, index: usize) -> Arc<Server> {
        self.nodes[index].server.clone()
    }

    /// Fresh setup led by node 0 among the first `size` nodes
    pub async fn setup(&self, version: &str, size: usize, threshold: usize, delay: u64) -> Group {
        let mut tasks = Vec::new();
        for (i, node) in self.nodes.iter().take(size).enumerate() {
            let role = if i == 0 {
                SetupRole::Leader(LeaderParams {
                    nodes: size,
                    threshold,
                    period: PERIOD,
                    delay,
                    dkg_timeout: 0,
                })
            } else {
                SetupRole::Participant {
                    leader: self.nodes[0].address.clone(),
                    leaving: false,
                }
            };
            let request = SetupRequest {
                version: version.to_string(),
                role,
                secret: SECRET.to_string(),
            };
            let server = node.server.clone();
            tasks.push(tokio::spawn(async move { server.setup(request).await }));
        }

        let mut groups = Vec::new();
        for task in tasks {
            let group = tokio::time::timeout(WAIT, task)
                .await
                .expect("setup in time")
                .unwrap()
                .expect("setup succeeds");
            groups.push(group);
        }
        for group in &groups[1..] {
            assert_eq!(group, &groups[0]);
        }
        groups.remove(0)
    }
}

/// Wait until `server` stored `round` of network `id`
pub async fn wait_round(server: &Server, id: &NetworkId, round: u64) {
    let instance = server.instance(id).expect("network registered");
    let chain = instance.chain().await.expect("chain open");
    let mut watch = chain.watch();
    tokio::time::timeout(WAIT, async {
        while *watch.borrow_and_update() < round {
            watch.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("round {} not stored in time", round));
}

/// Write a one node network of `keypair` straight to disk, as a DKG would
/// have left it. `folder` defaults to the hex identifier.
pub fn write_network(
    networks_dir: &Path,
    keypair: &KeyPair,
    version: Option<&str>,
    genesis: i64,
    folder: Option<&str>,
) -> Group {
    let mut rng = ChaCha20Rng::seed_from_u64(genesis as u64);
    let poly = crypto::random_poly(None, 1, &mut rng);
    let public = DistPublic {
        coefficients: crypto::commit_poly(&poly),
    };
    let share = Share {
        index: 0,
        secret: crypto::eval_poly(&poly, 0).to_bytes().to_vec(),
        commits: public.clone(),
    };
    let mut group = Group::new(vec![keypair.identity().clone()], 1, PERIOD, genesis);
    group.public_key = Some(public);

    let name = folder.map(str::to_string).unwrap_or_else(|| group.id().to_hex());
    let store = FileStore::new(networks_dir.join(name));
    if let Some(version) = version {
        store.save_version(version).unwrap();
    }
    store.save_share(&share).unwrap();
    store.save_group(&group).unwrap();
    group
}

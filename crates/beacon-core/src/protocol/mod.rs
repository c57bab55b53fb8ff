//! Protocol instances and the registry of protocol versions
//!
//! A [`Protocol`] is one beacon network as seen by this node: it answers
//! the whole [`Service`] surface for that network and owns its lifecycle
//! (setup, beacon start/stop, resharing, termination). The
//! [`Registry`] maps a version tag to the constructors of its instances.

mod process;
mod public;
mod registry;
mod version;

pub use process::BeaconProcess;
pub use registry::{Factory, FreshFn, LoadFn, Registry, BLACKLIST};
pub use version::{scheme_of, V1, V2};

use crate::beacon::ChainState;
use crate::clock::Clock;
use crate::config::BeaconConfig;
use crate::key::KeyPair;
use crate::net::{async_trait, ProtocolClient, Service};
use crate::types::{Group, NetworkId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything an instance shares with the rest of the node
#[derive(Clone)]
pub struct ProtocolConfig {
    pub keypair: Arc<KeyPair>,
    pub client: Arc<dyn ProtocolClient>,
    pub clock: Arc<dyn Clock>,
    pub beacon: BeaconConfig,
    /// Folder holding one sub folder per network
    pub networks_dir: PathBuf,
}

/// Where an instance stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unestablished,
    DkgInProgress,
    Established { beacon_running: bool },
    TransitionInProgress,
    Terminated,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Unestablished => f.write_str("unestablished"),
            Lifecycle::DkgInProgress => f.write_str("dkg in progress"),
            Lifecycle::Established { beacon_running: true } => f.write_str("established, beacon running"),
            Lifecycle::Established { beacon_running: false } => f.write_str("established, beacon stopped"),
            Lifecycle::TransitionInProgress => f.write_str("transition in progress"),
            Lifecycle::Terminated => f.write_str("terminated"),
        }
    }
}

/// Parameters the leader of a setup or resharing decides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderParams {
    /// Participants expected, leader included
    pub nodes: usize,
    pub threshold: usize,
    /// Round period in seconds, ignored when resharing
    #[serde(default)]
    pub period: u64,
    /// Seconds from now to the genesis (setup) or transition (resharing)
    pub delay: u64,
    /// Per phase DKG timeout in seconds, 0 for the node default
    #[serde(default)]
    pub dkg_timeout: u64,
}

/// Part this node plays in a setup or resharing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum SetupRole {
    Leader(LeaderParams),
    Participant {
        /// Address of the leader
        leader: String,
        /// Member of the old group only; waits for the leader instead
        /// of signaling
        #[serde(default)]
        leaving: bool,
    },
}

/// One beacon network run by this node
#[async_trait]
pub trait Protocol: Service {
    /// Version tag the instance was built from
    fn version(&self) -> &str;

    /// Network identifier, `None` before the first DKG completes
    fn id(&self) -> Option<NetworkId>;

    /// Identifier of the network a running DKG negotiates
    fn target_id(&self) -> Option<NetworkId>;

    /// Loaded from a folder without version marker
    fn is_legacy(&self) -> bool;

    async fn lifecycle(&self) -> Lifecycle;

    /// Current group, if any
    async fn group(&self) -> Option<Group>;

    /// Chain of the network once the group is known
    async fn chain(&self) -> Option<Arc<ChainState>>;

    /// Run the setup handshake and a fresh DKG, returning the new group
    async fn setup(&self, role: SetupRole, secret: &[u8]) -> Result<Group>;

    /// Run a resharing of `target`, then transition to the new group
    async fn reshare(&self, role: SetupRole, secret: &[u8], target: NetworkId) -> Result<Group>;

    /// Start beacon generation; a no-op when already running
    async fn start_beacon(&self, catchup: bool) -> Result<()>;

    /// Stop beacon generation and wait until it is gone
    async fn stop_beacon(&self);

    /// Stop everything and delete the persisted data of the network
    async fn terminate(&self) -> Result<()>;

    /// Stop everything, keeping the persisted data
    async fn shutdown(&self);

    /// One line status for operators
    async fn describe(&self) -> String;
}

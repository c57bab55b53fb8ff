//! Error types for beacon node operations

use crate::types::NetworkId;
use thiserror::Error;

/// Result type alias for beacon node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running one or more beacon networks
#[derive(Debug, Error)]
pub enum Error {
    /// No factory registered for this protocol version
    #[error("unknown protocol version: {0}")]
    UnknownVersion(String),

    /// Protocol version is on the deny-list
    #[error("blacklisted protocol version: {0}")]
    BlacklistedVersion(String),

    /// More than one legacy folder found at startup
    #[error("duplicate legacy network folder: {0}")]
    DuplicateLegacyInstance(String),

    /// Inbound message carries no identifier and no legacy alias exists
    #[error("no network identifier given and no legacy network registered")]
    MissingIdentifier,

    /// No running network with this identifier
    #[error("unknown network: {0}")]
    UnknownNetwork(NetworkId),

    /// A setup is already running on this node
    #[error("a network setup is already in progress")]
    SetupInProgress,

    /// DKG packet received with no session set up
    #[error("no dkg running")]
    NoDkgRunning,

    /// Signal received while this node does not lead a setup
    #[error("no setup manager running")]
    NoSetupManager,

    /// Pushed group received while this node does not wait for one
    #[error("no setup receiver running")]
    NoSetupReceiver,

    /// Beacon operation with no generator running
    #[error("beacon generation not started yet")]
    BeaconNotStarted,

    /// Operation requires a group and none is set up yet
    #[error("no group set up yet")]
    NoGroup,

    /// Requested round is not stored
    #[error("round {0} not found")]
    RoundNotFound(u64),

    /// This node is not part of the expected group
    #[error("node not in group: {0}")]
    NotInGroup(String),

    /// Partial signature failed verification
    #[error("invalid partial signature for round {round}: {reason}")]
    InvalidPartial { round: u64, reason: String },

    /// Full beacon failed verification
    #[error("invalid beacon for round {round}")]
    InvalidBeacon { round: u64 },

    /// Appending a round that does not directly follow the last one
    #[error("non contiguous round: expected {expected}, got {got}")]
    NonContiguousRound { expected: u64, got: u64 },

    /// DKG run failed
    #[error("dkg error: {0}")]
    Dkg(String),

    /// Threshold requirements not met
    #[error("threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Setup secret does not match
    #[error("invalid setup secret")]
    InvalidSecret,

    /// Instance has been terminated
    #[error("network terminated")]
    Terminated,

    /// Call not handled by this protocol
    #[error("call not implemented")]
    NotImplemented,

    /// Network/transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Persistent storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Serialization(e.to_string())
    }
}

//! # Beacon Core
//!
//! Core of a node taking part in one or more threshold randomness beacon
//! networks.
//!
//! This crate provides:
//! - Distributed Key Generation and resharing (joint-Feldman over BLS12-381)
//! - Periodic beacon generation from threshold partial signatures
//! - Chain storage, catch-up and gap-free streaming of rounds
//! - A registry of protocol versions and a server dispatching calls to
//!   every network the node runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use beacon_core::{protocol::Registry, Server};
//!
//! let server = Server::new(Registry::standard(), config);
//! let report = server.load_instances();
//! server.start_all(true).await;
//! ```

pub mod beacon;
pub mod chain;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dkg;
pub mod error;
pub mod key;
pub mod net;
pub mod protocol;
pub mod server;
pub mod types;

pub use error::{Error, Result};
pub use server::{LoadReport, ReshareRequest, Server, SetupRequest};
pub use types::{Beacon, ChainInfo, Group, Identity, NetworkId, Share};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default signing threshold of a three node network
pub const DEFAULT_THRESHOLD: usize = 2;

/// Default round period in seconds
pub const DEFAULT_PERIOD: u64 = 30;

//! Cryptographic capability used by the beacon core
//!
//! - BLS signatures over BLS12-381 (keys in G2, signatures in G1)
//! - Threshold partial signatures and their recovery
//! - Polynomial commitments for the DKG
//! - ECIES encryption of DKG deals
//!
//! Everything above this module treats these as opaque operations.

mod bls;
mod ecies;

pub use bls::{
    commit_poly, eval_commits, eval_poly, g1_from_bytes, g2_from_bytes, hash_to_g1,
    lagrange_coefficient, partial_index, public_from_secret, public_share, random_poly,
    random_scalar, recover, scalar_from_bytes, sign, sign_partial, verify, verify_partial,
};
pub use ecies::{decrypt, encrypt};

use crate::types::Beacon;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 over the concatenation of `parts`
pub fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// How the signed message of a round is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    /// Message covers the previous signature and the round
    Chained,
    /// Message covers the round only
    Unchained,
}

impl Scheme {
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Chained => "pedersen-bls-chained",
            Scheme::Unchained => "pedersen-bls-unchained",
        }
    }

    /// Whether a round depends on the signature of the previous one
    pub fn is_chained(&self) -> bool {
        matches!(self, Scheme::Chained)
    }

    /// Message signed for `round`
    pub fn digest(&self, round: u64, previous_signature: &[u8]) -> Vec<u8> {
        match self {
            Scheme::Chained => sha256(&[previous_signature, &round.to_be_bytes()]),
            Scheme::Unchained => sha256(&[&round.to_be_bytes()]),
        }
    }

    /// Verify a full beacon against the group public key
    pub fn verify_beacon(&self, public_key: &[u8], beacon: &Beacon) -> Result<()> {
        let msg = self.digest(beacon.round, &beacon.previous_signature);
        verify(public_key, &msg, &beacon.signature)
    }
}

//! Node key pair and per-network persistent key material

mod store;

pub use store::FileStore;

use crate::crypto;
use crate::types::{hex_bytes, Identity};
use crate::{Error, Result};
use bls12_381::Scalar;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Sub folder of the node root holding the key pair
pub const KEY_FOLDER: &str = "key";

/// File name of the key pair
pub const KEY_FILE: &str = "identity.json";

/// Long-term key pair of a node
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[serde(with = "hex_bytes")]
    secret: Vec<u8>,
    #[zeroize(skip)]
    public: Identity,
}

impl KeyPair {
    /// Generate a fresh self-signed key pair for `address`
    pub fn generate<R: RngCore + CryptoRng>(address: &str, rng: &mut R) -> Self {
        let secret = crypto::random_scalar(rng);
        let key = crypto::public_from_secret(&secret);
        let msg = Identity::self_sign_message(address, &key);
        let signature = crypto::sign(&secret, &msg);
        Self {
            secret: secret.to_bytes().to_vec(),
            public: Identity {
                address: address.to_string(),
                key,
                signature,
            },
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.public
    }

    /// Secret scalar of this key pair
    pub fn secret(&self) -> Result<Scalar> {
        crypto::scalar_from_bytes(&self.secret)
    }

    /// Location of the key pair under a node root folder
    pub fn path(root: &Path) -> PathBuf {
        root.join(KEY_FOLDER).join(KEY_FILE)
    }

    /// Load the key pair of the node rooted at `root`
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let json = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("reading key pair {:?}: {}", path, e)))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save the key pair under `root`
    pub fn save(&self, root: &Path) -> Result<()> {
        store::write_json(&Self::path(root), self)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_generated_key_is_self_signed() {
        let pair = KeyPair::generate("127.0.0.1:4444", &mut OsRng);
        assert!(pair.identity().valid_signature().is_ok());

        let mut forged = pair.identity().clone();
        forged.address = "127.0.0.1:5555".into();
        assert!(forged.valid_signature().is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KeyPair::generate("node:1", &mut OsRng);
        pair.save(dir.path()).unwrap();

        let loaded = KeyPair::load(dir.path()).unwrap();
        assert_eq!(loaded.identity(), pair.identity());
        assert_eq!(loaded.secret().unwrap(), pair.secret().unwrap());
    }
}

//! Setup handshake run before a DKG
//!
//! The leader gathers the identities of every participant through a
//! [`SetupManager`]; participants wait for the resulting group on a
//! [`SetupReceiver`]. Both sides prove knowledge of a shared secret.

use crate::crypto;
use crate::net::{DkgInfoPacket, SignalDkgPacket};
use crate::types::Identity;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Proof of knowledge of the setup secret sent on the wire
pub fn secret_proof(secret: &[u8]) -> Vec<u8> {
    crypto::sha256(&[b"setup-secret", secret])
}

/// Leader side: collects participant identities until the expected count
pub struct SetupManager {
    expected: usize,
    secret_proof: Vec<u8>,
    identities: Mutex<Vec<Identity>>,
    done: Mutex<Option<oneshot::Sender<Vec<Identity>>>>,
}

impl SetupManager {
    /// Manager expecting `expected` participants, the leader included
    pub fn new(
        leader: Identity,
        expected: usize,
        secret: &[u8],
    ) -> (Arc<Self>, oneshot::Receiver<Vec<Identity>>) {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::new(Self {
            expected,
            secret_proof: secret_proof(secret),
            identities: Mutex::new(vec![leader]),
            done: Mutex::new(Some(tx)),
        });
        manager.check_complete();
        (manager, rx)
    }

    /// Register a signaling participant
    pub fn received_key(&self, packet: &SignalDkgPacket) -> Result<()> {
        if packet.secret_proof != self.secret_proof {
            return Err(Error::InvalidSecret);
        }
        packet.node.valid_signature()?;

        {
            let mut identities = self.identities.lock();
            if identities.iter().any(|i| i.key == packet.node.key) {
                debug!(address = %packet.node.address, "participant already registered");
                return Ok(());
            }
            if identities.len() >= self.expected {
                return Err(Error::Dkg("setup already has every participant".into()));
            }
            identities.push(packet.node.clone());
            info!(
                address = %packet.node.address,
                have = identities.len(),
                want = self.expected,
                "participant registered"
            );
        }
        self.check_complete();
        Ok(())
    }

    fn check_complete(&self) {
        let identities = self.identities.lock();
        if identities.len() < self.expected {
            return;
        }
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(identities.clone());
        }
    }
}

/// Participant side: waits for the group pushed by the leader
pub struct SetupReceiver {
    secret_proof: Vec<u8>,
    tx: Mutex<Option<oneshot::Sender<DkgInfoPacket>>>,
}

impl SetupReceiver {
    pub fn new(secret: &[u8]) -> (Arc<Self>, oneshot::Receiver<DkgInfoPacket>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                secret_proof: secret_proof(secret),
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Check the pushed info proves the setup secret
    pub fn verify(&self, packet: &DkgInfoPacket) -> Result<()> {
        if packet.secret_proof != self.secret_proof {
            return Err(Error::InvalidSecret);
        }
        if self.tx.lock().is_none() {
            return Err(Error::NoSetupReceiver);
        }
        Ok(())
    }

    /// Hand the info to the waiting setup; only the first push is kept
    pub fn deliver(&self, packet: DkgInfoPacket) -> Result<()> {
        let tx = self.tx.lock().take().ok_or(Error::NoSetupReceiver)?;
        tx.send(packet)
            .map_err(|_| Error::Internal("setup no longer waiting".into()))
    }
}

//! Distributed key generation: setup handshake, session and engine

mod board;
mod messages;
mod protocol;
mod setup;

pub use board::Broadcaster;
pub use messages::{Bundle, Deal, DealBundle, Response, ResponseBundle, Status};
pub use protocol::{spawn, DkgConfig, DkgHandle, DkgResult};
pub use setup::{secret_proof, SetupManager, SetupReceiver};

use crate::types::Group;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Destination of the bundles a node produces
#[async_trait]
pub trait Board: Send + Sync {
    /// Deliver `bundle` to every other participant
    async fn push(&self, bundle: Bundle);
}

/// State of one DKG or resharing attempt.
///
/// Consumed exactly once: the completion receiver can only be taken once,
/// and dropping the session abandons the run.
pub struct DkgSession {
    /// Group being negotiated
    pub target: Group,
    /// Group being reshared, if any
    pub old: Option<Group>,
    started: bool,
    handle: DkgHandle,
    done: Option<oneshot::Receiver<Result<DkgResult>>>,
}

impl DkgSession {
    pub fn new(target: Group, old: Option<Group>, config: DkgConfig, board: Arc<dyn Board>) -> Result<Self> {
        let (handle, done) = protocol::spawn(config, board)?;
        Ok(Self {
            target,
            old,
            started: false,
            handle,
            done: Some(done),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Start the phase clock; returns whether this call started it
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.handle.start();
        true
    }

    /// Sender feeding bundles to the engine
    pub fn intake(&self) -> mpsc::Sender<Bundle> {
        self.handle.intake()
    }

    /// Take the completion channel; only the first waiter gets it
    pub fn take_done(&mut self) -> Result<oneshot::Receiver<Result<DkgResult>>> {
        self.done
            .take()
            .ok_or_else(|| Error::Dkg("dkg result already awaited".into()))
    }
}

impl Drop for DkgSession {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

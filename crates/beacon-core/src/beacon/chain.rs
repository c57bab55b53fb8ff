//! Chain of one network plus the listeners following it

use crate::chain::ChainStore;
use crate::types::Beacon;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Beacon>,
}

/// A registered listener; rounds after `last` arrive on `live`
pub struct Subscription {
    id: u64,
    key: String,
    /// Last stored round when the listener was registered
    pub last: u64,
    pub live: mpsc::Receiver<Beacon>,
}

/// Round store shared by the handler and the serving side.
///
/// Appending and registering a listener happen under the same lock, so a
/// listener sees every round after the one it was registered at.
pub struct ChainState {
    store: Arc<dyn ChainStore>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    last: watch::Sender<u64>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ChainState {
    /// Open a chain, seeding an empty store with the genesis entry
    pub fn open(store: Arc<dyn ChainStore>, genesis_seed: &[u8], buffer: usize) -> Result<Self> {
        if store.is_empty() {
            store.put(Beacon::genesis(genesis_seed))?;
        }
        let last = store.last()?.map(|b| b.round).unwrap_or_default();
        let (tx, _) = watch::channel(last);
        Ok(Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            last: tx,
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        })
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Last stored round, genesis included
    pub fn last(&self) -> Result<Beacon> {
        self.store
            .last()?
            .ok_or_else(|| Error::Internal("chain has no genesis".into()))
    }

    pub fn last_round(&self) -> u64 {
        *self.last.borrow()
    }

    /// Follow the last stored round number
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.last.subscribe()
    }

    /// Store the next round and hand it to every listener
    pub fn append(&self, beacon: Beacon) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        self.store.put(beacon.clone())?;
        self.last.send_replace(beacon.round);
        subscribers.retain(|key, sub| match sub.tx.try_send(beacon.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(listener = %key, error = %e, "dropping listener");
                false
            }
        });
        Ok(())
    }

    /// Register a listener under `key`, replacing any previous one
    pub fn subscribe(&self, key: &str) -> Result<Subscription> {
        let mut subscribers = self.subscribers.lock();
        let last = self.store.last()?.map(|b| b.round).unwrap_or_default();
        let (tx, live) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(key.to_string(), Subscriber { id, tx });
        Ok(Subscription {
            id,
            key: key.to_string(),
            last,
            live,
        })
    }

    /// Remove a listener unless it was replaced since
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.get(&sub.key).map(|s| s.id) == Some(sub.id) {
            subscribers.remove(&sub.key);
        }
    }

    pub fn listeners(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Send stored rounds from `from` then every new round to `tx`, until
    /// the receiving side goes away or the listener is dropped.
    ///
    /// `from == 0` skips the stored rounds.
    pub async fn follow<T, F>(&self, key: &str, from: u64, tx: &mpsc::Sender<T>, map: F) -> Result<()>
    where
        T: Send,
        F: Fn(&Beacon) -> T + Send + Sync,
    {
        let mut sub = self.subscribe(key)?;
        let result = self.forward(&mut sub, from, tx, &map).await;
        self.unsubscribe(&sub);
        result
    }

    async fn forward<T, F>(&self, sub: &mut Subscription, from: u64, tx: &mpsc::Sender<T>, map: &F) -> Result<()>
    where
        T: Send,
        F: Fn(&Beacon) -> T + Send + Sync,
    {
        if from != 0 && from <= sub.last {
            for beacon in self.store.range(from, sub.last)? {
                if tx.send(map(&beacon)).await.is_err() {
                    return Ok(());
                }
            }
        }
        loop {
            tokio::select! {
                beacon = sub.live.recv() => match beacon {
                    Some(beacon) if beacon.round >= from => {
                        if tx.send(map(&beacon)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => return Ok(()),
                },
                _ = tx.closed() => return Ok(()),
            }
        }
    }
}

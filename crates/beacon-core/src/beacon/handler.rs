//! Beacon generation loop of one network
//!
//! At every round boundary the handler signs a partial for the round after
//! the last stored one and sends it to the group. Partials coming back are
//! cached until a threshold of them recovers the full signature, which is
//! verified and appended to the chain.

use super::{ChainState, PartialCache, Syncer};
use crate::chain::{current_round, next_round, round_at_or_after, time_of_round};
use crate::clock::Clock;
use crate::config::BeaconConfig;
use crate::crypto::{self, Scheme};
use crate::net::{PartialBeaconPacket, ProtocolClient};
use crate::types::{Beacon, Group, Identity, NetworkId, Share};
use crate::{Error, Result};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Static settings of a handler
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub scheme: Scheme,
    /// Identifier written on outgoing partials
    pub beacon_id: NetworkId,
    pub own: Identity,
    pub config: BeaconConfig,
}

/// First round signed by a group taking over at its transition time
pub fn transition_round(group: &Group) -> u64 {
    round_at_or_after(group.transition_time, group.period, group.genesis_time)
}

#[derive(Clone)]
struct Material {
    group: Group,
    share: Share,
}

struct Signing {
    current: Material,
    /// Material taking over from a given round on
    next: Option<(u64, Material)>,
}

impl Signing {
    fn for_round(&self, round: u64) -> &Material {
        match &self.next {
            Some((from, material)) if round >= *from => material,
            _ => &self.current,
        }
    }

    /// Switch to the next material once `round` reaches it
    fn promote(&mut self, round: u64) -> bool {
        if !matches!(&self.next, Some((from, _)) if round >= *from) {
            return false;
        }
        match self.next.take() {
            Some((_, material)) => {
                self.current = material;
                true
            }
            None => false,
        }
    }
}

struct Inner {
    cfg: HandlerConfig,
    chain: Arc<ChainState>,
    client: Arc<dyn ProtocolClient>,
    clock: Arc<dyn Clock>,
    signing: RwLock<Signing>,
    cache: Mutex<PartialCache>,
    /// Rounds below belong to a previous group
    start_round: AtomicU64,
    /// No round happening after this time is signed
    stop_time: AtomicI64,
    sync_peers: RwLock<Vec<String>>,
    syncing: AtomicBool,
    stopped: AtomicBool,
}

struct Running {
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// Handle on the generation loop; clones share the same loop
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
    running: Arc<Mutex<Option<Running>>>,
}

impl Handler {
    pub fn new(
        cfg: HandlerConfig,
        chain: Arc<ChainState>,
        client: Arc<dyn ProtocolClient>,
        clock: Arc<dyn Clock>,
        group: Group,
        share: Share,
    ) -> Result<Self> {
        group.public_key()?;
        let peers = group.peers_except(&cfg.own.address);
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                chain,
                client,
                clock,
                signing: RwLock::new(Signing {
                    current: Material { group, share },
                    next: None,
                }),
                cache: Mutex::new(PartialCache::new()),
                start_round: AtomicU64::new(0),
                stop_time: AtomicI64::new(i64::MAX),
                sync_peers: RwLock::new(peers),
                syncing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            running: Arc::new(Mutex::new(None)),
        })
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.inner.chain
    }

    /// Group currently signing
    pub fn group(&self) -> Group {
        self.inner.signing.read().current.group.clone()
    }

    /// Begin at the next round boundary
    pub fn start(&self) {
        self.launch(false);
    }

    /// Fetch missed rounds from the group first, then run
    pub fn catchup(&self) {
        self.launch(true);
    }

    /// Run as a node joining through a resharing: rounds before the
    /// transition are fetched from `old` and the node signs from there on
    pub fn transition(&self, old: &Group) {
        let from = transition_round(&self.inner.signing.read().current.group);
        self.inner.start_round.store(from, Ordering::SeqCst);
        {
            let mut peers: Vec<String> = old
                .nodes
                .iter()
                .map(|n| n.address().to_string())
                .filter(|a| *a != self.inner.cfg.own.address)
                .collect();
            peers.extend(self.inner.sync_peers.read().iter().cloned());
            peers.sort();
            peers.dedup();
            *self.inner.sync_peers.write() = peers;
        }
        info!(from_round = from, "joining network at transition");
        self.launch(true);
    }

    /// Never sign a round happening after `time`; the loop exits on the
    /// first such round
    pub fn stop_at(&self, time: i64) {
        info!(time, "beacon scheduled to stop");
        self.inner.stop_time.store(time, Ordering::SeqCst);
    }

    /// Sign and verify with `share`/`group` from the group transition round on
    pub fn transition_new_group(&self, share: Share, group: Group) -> Result<()> {
        group.public_key()?;
        let from = transition_round(&group);
        info!(from_round = from, nodes = group.len(), "new group scheduled");
        self.inner.signing.write().next = Some((from, Material { group, share }));
        Ok(())
    }

    fn launch(&self, catchup: bool) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("beacon loop already running");
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        let stop = Arc::new(Notify::new());
        let inner = self.inner.clone();
        let signal = stop.clone();
        let task = tokio::spawn(async move { inner.run(catchup, signal).await });
        *running = Some(Running { task, stop });
    }

    /// Stop the loop and wait until it is gone
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.stop.notify_one();
            let _ = running.task.await;
            info!("beacon loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Take in a partial signature from a group member
    pub fn process_partial(&self, packet: PartialBeaconPacket) -> Result<()> {
        self.inner.process_partial(packet)
    }
}

impl Inner {
    fn timing(&self) -> (u64, i64) {
        let signing = self.signing.read();
        (signing.current.group.period, signing.current.group.genesis_time)
    }

    fn syncer(&self) -> Result<Syncer<'_>> {
        let public_key = self.signing.read().current.group.public_key()?.key().to_vec();
        Ok(Syncer {
            chain: &self.chain,
            client: self.client.as_ref(),
            scheme: self.cfg.scheme,
            public_key,
            beacon_id: self.cfg.beacon_id.clone(),
            timeout: self.cfg.config.sync_timeout,
        })
    }

    async fn run(self: Arc<Self>, catchup: bool, stop: Arc<Notify>) {
        info!(catchup, last = self.chain.last_round(), "beacon loop started");
        if catchup {
            tokio::select! {
                _ = stop.notified() => return,
                _ = self.catch_up() => {}
            }
        }
        loop {
            tokio::select! {
                _ = stop.notified() => break,
                step = self.step() => match step {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = %e, "beacon round failed");
                        tokio::time::sleep(self.cfg.config.catchup_period).await;
                    }
                },
            }
        }
        info!(last = self.chain.last_round(), "beacon loop exited");
    }

    async fn catch_up(&self) {
        let (period, genesis) = self.timing();
        let current = current_round(self.clock.now(), period, genesis);
        if self.chain.last_round() >= current {
            return;
        }
        let peers = self.sync_peers.read().clone();
        match self.syncer() {
            Ok(syncer) => {
                if let Err(e) = syncer.sync(&peers, current).await {
                    warn!(error = %e, "catch-up sync incomplete, rebuilding rounds");
                }
            }
            Err(e) => warn!(error = %e, "catch-up not possible"),
        }
    }

    /// One iteration of the loop; `false` once the loop must exit
    async fn step(self: &Arc<Self>) -> Result<bool> {
        let last = self.chain.last()?;
        let target = last.round + 1;
        let (period, genesis) = self.timing();
        let at = time_of_round(period, genesis, target);

        if at > self.stop_time.load(Ordering::SeqCst) {
            info!(round = target, "stop time reached");
            return Ok(false);
        }
        let now = self.clock.now();
        if at > now {
            self.clock.sleep_until(at).await;
            return Ok(true);
        }
        let current = current_round(now, period, genesis);

        let start_round = self.start_round.load(Ordering::SeqCst);
        if target < start_round {
            // produced by the previous group, fetched rather than signed
            let up_to = current.min(start_round - 1);
            let peers = self.sync_peers.read().clone();
            let synced = self.syncer()?.sync(&peers, up_to).await;
            if let Err(e) = synced {
                debug!(error = %e, "previous group rounds not synced yet");
                tokio::time::sleep(self.cfg.config.catchup_period).await;
            }
            return Ok(true);
        }

        let promoted = self.signing.write().promote(target);
        if promoted {
            let peers = self.signing.read().current.group.peers_except(&self.cfg.own.address);
            *self.sync_peers.write() = peers;
            info!(round = target, "new group took over");
        }
        self.sign_and_broadcast(target, &last.signature).await?;

        if target < current {
            tokio::time::sleep(self.cfg.config.catchup_period).await;
        } else {
            let mut watch = self.chain.watch();
            let (_, next_at) = next_round(now, period, genesis);
            tokio::select! {
                _ = wait_round(&mut watch, target) => {}
                _ = self.clock.sleep_until(next_at) => {}
            }
        }
        Ok(true)
    }

    async fn sign_and_broadcast(self: &Arc<Self>, round: u64, previous: &[u8]) -> Result<()> {
        let (packet, peers) = {
            let signing = self.signing.read();
            let material = signing.for_round(round);
            let msg = self.cfg.scheme.digest(round, previous);
            let partial_sig = crypto::sign_partial(&material.share, &msg)?;
            let packet = PartialBeaconPacket {
                beacon_id: self.cfg.beacon_id.clone(),
                round,
                previous_signature: previous.to_vec(),
                partial_sig,
            };
            (packet, material.group.peers_except(&self.cfg.own.address))
        };
        debug!(round, peers = peers.len(), "partial signed");

        if let Err(e) = self.process_partial(packet.clone()) {
            warn!(round, error = %e, "own partial rejected");
        }

        let sends = peers.iter().map(|peer| {
            let packet = packet.clone();
            async move { (peer, self.client.partial_beacon(peer, packet).await) }
        });
        for (peer, result) in join_all(sends).await {
            if let Err(e) = result {
                debug!(peer = %peer, round, error = %e, "partial not delivered");
            }
        }
        Ok(())
    }

    fn process_partial(self: &Arc<Self>, packet: PartialBeaconPacket) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::BeaconNotStarted);
        }
        let round = packet.round;
        let (period, genesis) = self.timing();
        let now_round = current_round(self.clock.now(), period, genesis);
        if round > now_round.saturating_add(1) {
            return Err(Error::InvalidPartial {
                round,
                reason: format!("future round, current is {}", now_round),
            });
        }
        if time_of_round(period, genesis, round) > self.stop_time.load(Ordering::SeqCst) {
            debug!(round, "partial after stop time ignored");
            return Ok(());
        }
        if round < self.start_round.load(Ordering::SeqCst) {
            debug!(round, "partial for previous group ignored");
            return Ok(());
        }

        let mut cache = self.cache.lock();
        let last = self.chain.last()?;
        if round <= last.round {
            debug!(round, last = last.round, "late partial ignored");
            return Ok(());
        }
        let oldest = (last.round + 1).max(now_round.saturating_sub(self.cfg.config.partial_cache_rounds));
        cache.flush_below(oldest);

        let (public, threshold) = {
            let signing = self.signing.read();
            let material = signing.for_round(round);
            (material.group.public_key()?.clone(), material.group.threshold)
        };
        let msg = self.cfg.scheme.digest(round, &packet.previous_signature);
        crypto::verify_partial(&public, &msg, &packet.partial_sig).map_err(|e| Error::InvalidPartial {
            round,
            reason: e.to_string(),
        })?;
        let signer = crypto::partial_index(&packet.partial_sig)?;
        let count = cache.append(round, &packet.previous_signature, signer, packet.partial_sig);
        debug!(round, signer, count, threshold, "partial accepted");

        if round > last.round + 1 {
            drop(cache);
            self.trigger_sync(round - 1);
            return Ok(());
        }
        if count >= threshold {
            self.aggregate(&mut cache, last)?;
        }
        Ok(())
    }

    /// Recover and store every round the cache holds enough partials for
    fn aggregate(&self, cache: &mut PartialCache, mut last: Beacon) -> Result<()> {
        loop {
            let round = last.round + 1;
            let (public, threshold) = {
                let signing = self.signing.read();
                let material = signing.for_round(round);
                (material.group.public_key()?.clone(), material.group.threshold)
            };
            let partials = cache.get(round, &last.signature);
            if partials.len() < threshold {
                return Ok(());
            }

            let signature = crypto::recover(&partials, threshold)?;
            let beacon = Beacon {
                round,
                signature,
                previous_signature: last.signature.clone(),
            };
            if let Err(e) = self.cfg.scheme.verify_beacon(public.key(), &beacon) {
                error!(round, error = %e, "recovered beacon does not verify");
                return Err(Error::InvalidBeacon { round });
            }
            self.chain.append(beacon.clone())?;
            cache.flush_below(round + 1);
            info!(round, randomness = %hex::encode(beacon.randomness()), "beacon stored");
            last = beacon;
        }
    }

    fn trigger_sync(self: &Arc<Self>, up_to: u64) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(up_to, "partial ahead of chain, syncing");
        let inner = self.clone();
        tokio::spawn(async move {
            let peers = inner.sync_peers.read().clone();
            if let Ok(syncer) = inner.syncer() {
                if let Err(e) = syncer.sync(&peers, up_to).await {
                    debug!(error = %e, "background sync incomplete");
                }
            }
            inner.syncing.store(false, Ordering::SeqCst);
            inner.aggregate_cached();
        });
    }

    fn aggregate_cached(&self) {
        let mut cache = self.cache.lock();
        if let Ok(last) = self.chain.last() {
            if let Err(e) = self.aggregate(&mut cache, last) {
                debug!(error = %e, "cached partials not usable");
            }
        }
    }
}

async fn wait_round(rx: &mut watch::Receiver<u64>, round: u64) {
    while *rx.borrow_and_update() < round {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryStore;
    use crate::clock::ManualClock;
    use crate::key::KeyPair;
    use crate::net::MemoryNetwork;
    use crate::types::DistPublic;
    use rand::rngs::OsRng;
    use std::time::Duration;

    const GENESIS: i64 = 1000;
    const PERIOD: u64 = 10;

    struct Fixture {
        handler: Handler,
        clock: Arc<ManualClock>,
        group: Group,
    }

    fn single_node(scheme: Scheme) -> Fixture {
        let pair = KeyPair::generate("solo:1", &mut OsRng);
        let poly = crypto::random_poly(None, 1, &mut OsRng);
        let public = DistPublic {
            coefficients: crypto::commit_poly(&poly),
        };
        let share = Share {
            index: 0,
            secret: crypto::eval_poly(&poly, 0).to_bytes().to_vec(),
            commits: public.clone(),
        };
        let mut group = Group::new(vec![pair.identity().clone()], 1, PERIOD, GENESIS);
        group.public_key = Some(public);

        let clock = Arc::new(ManualClock::new(GENESIS - 5));
        let chain = Arc::new(ChainState::open(Arc::new(MemoryStore::new()), &group.genesis_seed, 16).unwrap());
        let config = BeaconConfig {
            catchup_period: Duration::from_millis(5),
            sync_timeout: Duration::from_millis(50),
            ..BeaconConfig::default()
        };
        let handler = Handler::new(
            HandlerConfig {
                scheme,
                beacon_id: group.id(),
                own: pair.identity().clone(),
                config,
            },
            chain,
            MemoryNetwork::new().client("solo:1"),
            clock.clone(),
            group.clone(),
            share,
        )
        .unwrap();
        Fixture { handler, clock, group }
    }

    async fn wait_for(handler: &Handler, round: u64) {
        let mut watch = handler.chain().watch();
        tokio::time::timeout(Duration::from_secs(10), wait_round(&mut watch, round))
            .await
            .expect("round not produced in time");
    }

    #[test]
    fn test_transition_round_aligns_up() {
        let mut group = Group::new(vec![], 1, PERIOD, GENESIS);
        group.transition_time = GENESIS + 30;
        assert_eq!(transition_round(&group), 4);
        group.transition_time = GENESIS + 31;
        assert_eq!(transition_round(&group), 5);
    }

    #[tokio::test]
    async fn test_produces_verifiable_gap_free_rounds() {
        let f = single_node(Scheme::Chained);
        f.handler.start();

        f.clock.set(GENESIS);
        wait_for(&f.handler, 1).await;

        // jump ahead, missed rounds are rebuilt
        f.clock.set(GENESIS + 35);
        wait_for(&f.handler, 4).await;

        let key = f.group.public_key().unwrap().key().to_vec();
        let rounds = f.handler.chain().store().range(0, 4).unwrap();
        for pair in rounds.windows(2) {
            assert_eq!(pair[1].round, pair[0].round + 1);
            assert_eq!(pair[1].previous_signature, pair[0].signature);
            Scheme::Chained.verify_beacon(&key, &pair[1]).unwrap();
        }
        f.handler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_at_keeps_rounds_before_time() {
        let f = single_node(Scheme::Unchained);
        let transition = GENESIS + 3 * PERIOD as i64;
        f.handler.stop_at(transition - 1);
        f.handler.start();

        f.clock.set(transition + 2 * PERIOD as i64);
        wait_for(&f.handler, 3).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.handler.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let last = f.handler.chain().last().unwrap();
        assert_eq!(last.round, 3);
        assert!(time_of_round(PERIOD, GENESIS, last.round) < transition);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_rejects_partials() {
        let f = single_node(Scheme::Chained);
        f.handler.start();
        f.handler.start();
        assert!(f.handler.is_running());

        f.handler.stop().await;
        f.handler.stop().await;
        assert!(!f.handler.is_running());

        let packet = PartialBeaconPacket {
            beacon_id: f.group.id(),
            round: 1,
            previous_signature: f.group.genesis_seed.clone(),
            partial_sig: vec![0; 50],
        };
        assert!(matches!(f.handler.process_partial(packet), Err(Error::BeaconNotStarted)));
    }

    #[tokio::test]
    async fn test_late_partial_is_ignored() {
        let f = single_node(Scheme::Chained);
        f.handler.start();
        f.clock.set(GENESIS);
        wait_for(&f.handler, 1).await;

        let stored = f.handler.chain().store().get(1).unwrap().unwrap();
        let packet = PartialBeaconPacket {
            beacon_id: f.group.id(),
            round: 1,
            previous_signature: stored.previous_signature.clone(),
            partial_sig: vec![0; 50],
        };
        f.handler.process_partial(packet).unwrap();
        assert_eq!(f.handler.chain().last_round(), 1);
        f.handler.stop().await;
    }

    #[tokio::test]
    async fn test_far_future_partial_is_rejected() {
        let f = single_node(Scheme::Chained);
        f.handler.start();
        f.clock.set(GENESIS);
        wait_for(&f.handler, 1).await;

        for round in [u64::MAX, u64::MAX / 2, 10] {
            let packet = PartialBeaconPacket {
                beacon_id: f.group.id(),
                round,
                previous_signature: vec![0; 96],
                partial_sig: vec![0; 50],
            };
            let result = f.handler.process_partial(packet);
            assert!(matches!(result, Err(Error::InvalidPartial { round: r, .. }) if r == round));
        }
        assert_eq!(f.handler.chain().last_round(), 1);
        f.handler.stop().await;
    }
}

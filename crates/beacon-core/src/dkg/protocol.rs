//! Joint-Feldman DKG engine, fresh and resharing
//!
//! The engine runs on its own task. It waits for the start signal, then
//! goes through the deal and response phases; each phase ends when every
//! expected bundle arrived or after the phase timeout. The outcome is
//! delivered once on a oneshot channel.

use super::messages::{Bundle, Deal, DealBundle, Response, ResponseBundle, Status};
use super::Board;
use crate::crypto;
use crate::types::{DistPublic, Identity, Node, Share};
use crate::{Error, Result};
use bls12_381::{G2Affine, G2Projective, Scalar};
use ff::Field;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Bundles buffered before the engine consumes them
const INTAKE_BUFFER: usize = 1024;

/// Parameters of one DKG run
#[derive(Clone)]
pub struct DkgConfig {
    /// Long-term secret of this node, decrypts incoming deals
    pub longterm: Scalar,
    pub own: Identity,
    /// Holders of the new shares
    pub new_nodes: Vec<Node>,
    pub threshold: usize,
    /// Dealers of a resharing, empty for a fresh run
    pub old_nodes: Vec<Node>,
    pub old_threshold: usize,
    /// Public polynomial being reshared
    pub old_public: Option<DistPublic>,
    /// Share this node deals from in a resharing
    pub share: Option<Share>,
    /// Binds every bundle to this run
    pub nonce: Vec<u8>,
    pub timeout: Duration,
}

impl DkgConfig {
    pub fn is_resharing(&self) -> bool {
        self.old_public.is_some()
    }

    fn dealers(&self) -> &[Node] {
        if self.is_resharing() {
            &self.old_nodes
        } else {
            &self.new_nodes
        }
    }

    fn dealer_index(&self) -> Option<u32> {
        if self.is_resharing() {
            let share = self.share.as_ref()?;
            self.old_nodes
                .iter()
                .find(|n| n.identity.key == self.own.key && n.index == share.index)
                .map(|n| n.index)
        } else {
            self.holder_index()
        }
    }

    fn holder_index(&self) -> Option<u32> {
        self.new_nodes
            .iter()
            .find(|n| n.identity.key == self.own.key)
            .map(|n| n.index)
    }

    /// Addresses of every other participant, dealers and holders
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .old_nodes
            .iter()
            .chain(self.new_nodes.iter())
            .filter(|n| n.identity.key != self.own.key)
            .map(|n| n.address().to_string())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct DkgResult {
    /// Indices of the qualified share holders
    pub qual: Vec<u32>,
    /// Share of this node, absent when it holds none in the new group
    pub share: Option<Share>,
}

/// Handle on a running engine
pub struct DkgHandle {
    intake: mpsc::Sender<Bundle>,
    start: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DkgHandle {
    /// Start the phaser; only the first call has an effect
    pub fn start(&self) {
        self.start.notify_one();
    }

    /// Sender feeding incoming bundles to the engine
    pub fn intake(&self) -> mpsc::Sender<Bundle> {
        self.intake.clone()
    }

    /// Abandon the run
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the engine; it idles until [`DkgHandle::start`]
pub fn spawn(
    config: DkgConfig,
    board: Arc<dyn Board>,
) -> Result<(DkgHandle, oneshot::Receiver<Result<DkgResult>>)> {
    if config.new_nodes.len() < config.threshold || config.threshold == 0 {
        return Err(Error::Dkg(format!(
            "threshold {} invalid for {} nodes",
            config.threshold,
            config.new_nodes.len()
        )));
    }
    if config.is_resharing() && config.old_nodes.len() < config.old_threshold {
        return Err(Error::Dkg("old group smaller than its threshold".into()));
    }

    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let start = Arc::new(Notify::new());

    let engine = Engine {
        config,
        board,
        intake: intake_rx,
        deals: BTreeMap::new(),
        responses: BTreeMap::new(),
    };
    let signal = start.clone();
    let task = tokio::spawn(async move {
        signal.notified().await;
        let result = engine.run().await;
        if let Err(e) = &result {
            warn!(error = %e, "dkg run failed");
        }
        let _ = done_tx.send(result);
    });

    Ok((
        DkgHandle {
            intake: intake_tx,
            start,
            task,
        },
        done_rx,
    ))
}

struct Engine {
    config: DkgConfig,
    board: Arc<dyn Board>,
    intake: mpsc::Receiver<Bundle>,
    deals: BTreeMap<u32, DealBundle>,
    responses: BTreeMap<u32, ResponseBundle>,
}

impl Engine {
    #[instrument(skip(self), fields(resharing = self.config.is_resharing()))]
    async fn run(mut self) -> Result<DkgResult> {
        info!(
            dealers = self.config.dealers().len(),
            holders = self.config.new_nodes.len(),
            threshold = self.config.threshold,
            "dkg phaser started"
        );

        if let Some(index) = self.config.dealer_index() {
            let bundle = self.deal(index)?;
            self.deals.insert(index, bundle.clone());
            self.board.push(Bundle::Deal(bundle)).await;
        }
        let expected_deals = self.config.dealers().len();
        self.collect(|e| e.deals.len() >= expected_deals).await;
        debug!(received = self.deals.len(), "deal phase over");

        let mut received = BTreeMap::new();
        if let Some(index) = self.config.holder_index() {
            let (bundle, shares) = self.respond(index)?;
            received = shares;
            self.responses.insert(index, bundle.clone());
            self.board.push(Bundle::Response(bundle)).await;
        }
        let expected_responses = self.config.new_nodes.len();
        self.collect(|e| e.responses.len() >= expected_responses).await;
        debug!(received = self.responses.len(), "response phase over");

        self.finish(received)
    }

    /// Consume incoming bundles until `done` holds or the phase times out
    async fn collect(&mut self, done: impl Fn(&Engine) -> bool) {
        let deadline = Instant::now() + self.config.timeout;
        while !done(self) {
            tokio::select! {
                bundle = self.intake.recv() => match bundle {
                    Some(bundle) => self.accept(bundle),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("dkg phase timed out");
                    break;
                }
            }
        }
    }

    fn accept(&mut self, bundle: Bundle) {
        if bundle.session_id() != self.config.nonce.as_slice() {
            warn!("dkg bundle from another session dropped");
            return;
        }
        match bundle {
            Bundle::Deal(deal) => {
                let Some(dealer) = self.config.dealers().iter().find(|n| n.index == deal.dealer_index) else {
                    warn!(dealer = deal.dealer_index, "deal from unknown dealer");
                    return;
                };
                if crypto::verify(&dealer.identity.key, &deal.hash(), &deal.signature).is_err() {
                    warn!(dealer = deal.dealer_index, "deal with invalid signature");
                    return;
                }
                if deal.commits.len() != self.config.threshold {
                    warn!(dealer = deal.dealer_index, "deal with wrong commitment count");
                    return;
                }
                self.deals.entry(deal.dealer_index).or_insert(deal);
            }
            Bundle::Response(response) => {
                let Some(holder) = self.config.new_nodes.iter().find(|n| n.index == response.share_index) else {
                    warn!(holder = response.share_index, "response from unknown holder");
                    return;
                };
                if crypto::verify(&holder.identity.key, &response.hash(), &response.signature).is_err() {
                    warn!(holder = response.share_index, "response with invalid signature");
                    return;
                }
                self.responses.entry(response.share_index).or_insert(response);
            }
        }
    }

    fn deal(&self, index: u32) -> Result<DealBundle> {
        let secret = match &self.config.share {
            Some(share) if self.config.is_resharing() => Some(crypto::scalar_from_bytes(&share.secret)?),
            _ => None,
        };
        let poly = crypto::random_poly(secret, self.config.threshold, &mut OsRng);
        let commits = crypto::commit_poly(&poly);

        let mut deals = Vec::with_capacity(self.config.new_nodes.len());
        for holder in &self.config.new_nodes {
            let value = crypto::eval_poly(&poly, holder.index);
            let encrypted_share = crypto::encrypt(&holder.identity.key, &value.to_bytes(), &mut OsRng)?;
            deals.push(Deal {
                share_index: holder.index,
                encrypted_share,
            });
        }

        let mut bundle = DealBundle {
            dealer_index: index,
            commits,
            deals,
            session_id: self.config.nonce.clone(),
            signature: Vec::new(),
        };
        bundle.signature = crypto::sign(&self.config.longterm, &bundle.hash());
        Ok(bundle)
    }

    /// Check every deal addressed to us, keeping the valid evaluations
    fn respond(&self, index: u32) -> Result<(ResponseBundle, BTreeMap<u32, Scalar>)> {
        let mut shares = BTreeMap::new();
        let mut responses = Vec::new();
        for dealer in self.config.dealers() {
            let status = match self.deals.get(&dealer.index) {
                Some(bundle) => match self.check_deal(bundle, index) {
                    Ok(value) => {
                        shares.insert(dealer.index, value);
                        Status::Approved
                    }
                    Err(e) => {
                        warn!(dealer = dealer.index, error = %e, "complaint against dealer");
                        Status::Complaint
                    }
                },
                None => {
                    warn!(dealer = dealer.index, "no deal received, complaining");
                    Status::Complaint
                }
            };
            responses.push(Response {
                dealer_index: dealer.index,
                status,
            });
        }

        let mut bundle = ResponseBundle {
            share_index: index,
            responses,
            session_id: self.config.nonce.clone(),
            signature: Vec::new(),
        };
        bundle.signature = crypto::sign(&self.config.longterm, &bundle.hash());
        Ok((bundle, shares))
    }

    fn check_deal(&self, bundle: &DealBundle, index: u32) -> Result<Scalar> {
        let deal = bundle
            .deals
            .iter()
            .find(|d| d.share_index == index)
            .ok_or_else(|| Error::Dkg("no deal for this holder".into()))?;
        let plain = crypto::decrypt(&self.config.longterm, &deal.encrypted_share)?;
        let value = crypto::scalar_from_bytes(&plain)?;

        let expected = crypto::eval_commits(&bundle.commits, index)?;
        if crypto::public_from_secret(&value) != expected.to_compressed().to_vec() {
            return Err(Error::Dkg("share does not match commitments".into()));
        }

        if let Some(old_public) = &self.config.old_public {
            let old_share = crypto::public_share(old_public, bundle.dealer_index)?;
            if bundle.commits[0] != old_share.to_compressed().to_vec() {
                return Err(Error::Dkg("reshared secret does not match old share".into()));
            }
        }
        Ok(value)
    }

    fn finish(self, received: BTreeMap<u32, Scalar>) -> Result<DkgResult> {
        let resharing = self.config.is_resharing();
        let qual_dealers: Vec<u32> = self
            .config
            .dealers()
            .iter()
            .map(|n| n.index)
            .filter(|d| self.deals.contains_key(d))
            .filter(|d| !self.responses.values().any(|r| r.complains_about(*d)))
            .collect();

        let required = if resharing {
            self.config.old_threshold
        } else {
            self.config.threshold
        };
        if qual_dealers.len() < required {
            return Err(Error::Dkg(format!(
                "{} qualified dealers, {} required",
                qual_dealers.len(),
                required
            )));
        }

        let qual: Vec<u32> = self
            .config
            .new_nodes
            .iter()
            .map(|n| n.index)
            .filter(|h| self.responses.contains_key(h))
            .filter(|h| resharing || qual_dealers.contains(h))
            .collect();
        if qual.len() < self.config.threshold {
            return Err(Error::ThresholdNotMet {
                required: self.config.threshold,
                actual: qual.len(),
            });
        }

        // a resharing only needs old threshold many dealers to interpolate
        let used: Vec<u32> = if resharing {
            qual_dealers[..required].to_vec()
        } else {
            qual_dealers.clone()
        };
        let weights: Vec<Scalar> = if resharing {
            used.iter()
                .map(|d| crypto::lagrange_coefficient(*d, &used))
                .collect::<Result<_>>()?
        } else {
            vec![Scalar::ONE; used.len()]
        };

        let commits = self.combine_commits(&used, &weights)?;
        if let Some(old_public) = &self.config.old_public {
            if commits.first().map(Vec::as_slice) != Some(old_public.key()) {
                return Err(Error::Dkg("reshared public key differs from the old one".into()));
            }
        }

        let share = match self.config.holder_index() {
            Some(index) if qual.contains(&index) => {
                let mut secret = Scalar::ZERO;
                for (dealer, weight) in used.iter().zip(&weights) {
                    let value = received
                        .get(dealer)
                        .ok_or_else(|| Error::Dkg(format!("missing share from dealer {}", dealer)))?;
                    secret += value * weight;
                }
                Some(Share {
                    index,
                    secret: secret.to_bytes().to_vec(),
                    commits: DistPublic { coefficients: commits },
                })
            }
            _ => None,
        };

        info!(qual = ?qual, dealers = ?used, "dkg finished");
        Ok(DkgResult { qual, share })
    }

    /// Weighted coefficient-wise sum of the dealer commitments
    fn combine_commits(&self, used: &[u32], weights: &[Scalar]) -> Result<Vec<Vec<u8>>> {
        let mut acc = vec![G2Projective::identity(); self.config.threshold];
        for (dealer, weight) in used.iter().zip(weights) {
            let bundle = self
                .deals
                .get(dealer)
                .ok_or_else(|| Error::Dkg(format!("missing deal of dealer {}", dealer)))?;
            for (slot, commit) in acc.iter_mut().zip(&bundle.commits) {
                *slot += G2Projective::from(crypto::g2_from_bytes(commit)?) * weight;
            }
        }
        Ok(acc
            .iter()
            .map(|p| G2Affine::from(p).to_compressed().to_vec())
            .collect())
    }
}

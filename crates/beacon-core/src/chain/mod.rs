//! Beacon round storage and round/time arithmetic

mod file;
mod memory;

pub use file::FileChainStore;
pub use memory::MemoryStore;

use crate::types::Beacon;
use crate::Result;

/// Ordered, round indexed store of produced beacons.
///
/// Implementations must refuse a round that does not directly follow the
/// last stored one.
pub trait ChainStore: Send + Sync {
    /// Number of stored rounds, genesis included
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the next round
    fn put(&self, beacon: Beacon) -> Result<()>;

    /// Last stored round, `None` on an empty store
    fn last(&self) -> Result<Option<Beacon>>;

    /// Exact round lookup
    fn get(&self, round: u64) -> Result<Option<Beacon>>;

    /// Rounds in `[from, to]`, in increasing order
    fn range(&self, from: u64, to: u64) -> Result<Vec<Beacon>>;

    /// Remove every stored round
    fn destroy(&self) -> Result<()>;
}

/// Round happening at unix time `now`; 0 before genesis
pub fn current_round(now: i64, period: u64, genesis: i64) -> u64 {
    if now < genesis || period == 0 {
        return 0;
    }
    (now - genesis) as u64 / period + 1
}

/// Unix time at which `round` happens, saturating at `i64::MAX`
pub fn time_of_round(period: u64, genesis: i64, round: u64) -> i64 {
    if round == 0 {
        return genesis;
    }
    let offset = (round - 1).saturating_mul(period);
    genesis.saturating_add(i64::try_from(offset).unwrap_or(i64::MAX))
}

/// First round happening at or after `time`
pub fn round_at_or_after(time: i64, period: u64, genesis: i64) -> u64 {
    let round = current_round(time, period, genesis);
    if round == 0 || time_of_round(period, genesis, round) < time {
        round + 1
    } else {
        round
    }
}

/// Next round after `now` and the time it happens
pub fn next_round(now: i64, period: u64, genesis: i64) -> (u64, i64) {
    if now < genesis {
        return (1, genesis);
    }
    let next = current_round(now, period, genesis) + 1;
    (next, time_of_round(period, genesis, next))
}

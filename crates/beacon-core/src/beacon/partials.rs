//! Cache of partial signatures waiting for a threshold

use std::collections::BTreeMap;

/// Partials grouped by `(round, previous signature)`, one per signer
#[derive(Debug, Default)]
pub struct PartialCache {
    rounds: BTreeMap<(u64, Vec<u8>), BTreeMap<u32, Vec<u8>>>,
}

impl PartialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partial from `signer`; returns how many distinct signers the
    /// entry now has
    pub fn append(&mut self, round: u64, previous: &[u8], signer: u32, partial: Vec<u8>) -> usize {
        let entry = self.rounds.entry((round, previous.to_vec())).or_default();
        entry.entry(signer).or_insert(partial);
        entry.len()
    }

    /// Partials collected for an entry
    pub fn get(&self, round: u64, previous: &[u8]) -> Vec<Vec<u8>> {
        self.rounds
            .get(&(round, previous.to_vec()))
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every entry of a round below `round`
    pub fn flush_below(&mut self, round: u64) {
        self.rounds.retain(|(r, _), _| *r >= round);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

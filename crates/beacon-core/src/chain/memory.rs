//! In-memory chain store

use super::ChainStore;
use crate::types::Beacon;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Chain store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    rounds: RwLock<BTreeMap<u64, Beacon>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared contiguity rule of every store
pub(super) fn check_next(rounds: &BTreeMap<u64, Beacon>, beacon: &Beacon) -> Result<()> {
    if let Some((&last, _)) = rounds.last_key_value() {
        if beacon.round != last + 1 {
            return Err(Error::NonContiguousRound {
                expected: last + 1,
                got: beacon.round,
            });
        }
    }
    Ok(())
}

impl ChainStore for MemoryStore {
    fn len(&self) -> usize {
        self.rounds.read().len()
    }

    fn put(&self, beacon: Beacon) -> Result<()> {
        let mut rounds = self.rounds.write();
        check_next(&rounds, &beacon)?;
        rounds.insert(beacon.round, beacon);
        Ok(())
    }

    fn last(&self) -> Result<Option<Beacon>> {
        Ok(self.rounds.read().values().next_back().cloned())
    }

    fn get(&self, round: u64) -> Result<Option<Beacon>> {
        Ok(self.rounds.read().get(&round).cloned())
    }

    fn range(&self, from: u64, to: u64) -> Result<Vec<Beacon>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.rounds.read().range(from..=to).map(|(_, b)| b.clone()).collect())
    }

    fn destroy(&self) -> Result<()> {
        self.rounds.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(round: u64) -> Beacon {
        Beacon {
            round,
            signature: vec![round as u8],
            previous_signature: vec![],
        }
    }

    #[test]
    fn test_contiguous_put() {
        let store = MemoryStore::new();
        store.put(beacon(0)).unwrap();
        store.put(beacon(1)).unwrap();

        let err = store.put(beacon(3)).unwrap_err();
        assert!(matches!(err, Error::NonContiguousRound { expected: 2, got: 3 }));
        assert!(store.put(beacon(1)).is_err());

        assert_eq!(store.last().unwrap().unwrap().round, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_range() {
        let store = MemoryStore::new();
        for r in 0..10 {
            store.put(beacon(r)).unwrap();
        }
        let rounds: Vec<u64> = store.range(5, 20).unwrap().iter().map(|b| b.round).collect();
        assert_eq!(rounds, vec![5, 6, 7, 8, 9]);
        assert!(store.get(10).unwrap().is_none());
    }
}

//! Append-only chain store backed by a JSON lines file

use super::memory::check_next;
use super::ChainStore;
use crate::types::Beacon;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

struct Inner {
    rounds: BTreeMap<u64, Beacon>,
    file: Option<File>,
}

/// Chain store writing one JSON object per round, mirrored in memory
pub struct FileChainStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl FileChainStore {
    /// Open or create the store at `path`, reading every stored round
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut rounds = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Beacon>(&line) {
                    Ok(beacon) => {
                        check_next(&rounds, &beacon)?;
                        rounds.insert(beacon.round, beacon);
                    }
                    // a crash mid-write leaves a torn last line
                    Err(e) => {
                        warn!(path = ?path, line = line_no + 1, error = %e, "skipping unreadable round");
                        break;
                    }
                }
            }
        }
        debug!(path = ?path, rounds = rounds.len(), "chain store opened");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                rounds,
                file: Some(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChainStore for FileChainStore {
    fn len(&self) -> usize {
        self.inner.read().rounds.len()
    }

    fn put(&self, beacon: Beacon) -> Result<()> {
        let mut inner = self.inner.write();
        check_next(&inner.rounds, &beacon)?;
        let mut line = serde_json::to_string(&beacon)?;
        line.push('\n');
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| Error::Storage("chain store destroyed".into()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        inner.rounds.insert(beacon.round, beacon);
        Ok(())
    }

    fn last(&self) -> Result<Option<Beacon>> {
        Ok(self.inner.read().rounds.values().next_back().cloned())
    }

    fn get(&self, round: u64) -> Result<Option<Beacon>> {
        Ok(self.inner.read().rounds.get(&round).cloned())
    }

    fn range(&self, from: u64, to: u64) -> Result<Vec<Beacon>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .read()
            .rounds
            .range(from..=to)
            .map(|(_, b)| b.clone())
            .collect())
    }

    fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.file = None;
        inner.rounds.clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

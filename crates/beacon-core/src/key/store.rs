//! File backed store for the group, share and version marker of one network

use crate::types::{Group, Share};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const VERSION_FILE: &str = "version";
const GROUP_FILE: &str = "group.json";
const SHARE_FILE: &str = "share.json";
const BEACON_FILE: &str = "beacons.jsonl";

/// Write `value` as pretty JSON, going through a temporary file
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| Error::Storage(format!("reading {:?}: {}", path, e)))?;
    Ok(serde_json::from_str(&json)?)
}

/// Persistent key material of one network, rooted at its folder
#[derive(Debug, Clone)]
pub struct FileStore {
    folder: PathBuf,
}

impl FileStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the beacon round database
    pub fn beacon_path(&self) -> PathBuf {
        self.folder.join(BEACON_FILE)
    }

    /// Write the version marker
    pub fn save_version(&self, version: &str) -> Result<()> {
        std::fs::create_dir_all(&self.folder)?;
        std::fs::write(self.folder.join(VERSION_FILE), version)?;
        Ok(())
    }

    /// Read the version marker; `None` for a legacy folder
    pub fn load_version(&self) -> Result<Option<String>> {
        let path = self.folder.join(VERSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?.trim().to_string()))
    }

    pub fn save_group(&self, group: &Group) -> Result<()> {
        debug!(folder = ?self.folder, "saving group");
        write_json(&self.folder.join(GROUP_FILE), group)
    }

    pub fn load_group(&self) -> Result<Group> {
        read_json(&self.folder.join(GROUP_FILE))
    }

    pub fn save_share(&self, share: &Share) -> Result<()> {
        debug!(folder = ?self.folder, index = share.index, "saving share");
        write_json(&self.folder.join(SHARE_FILE), share)
    }

    pub fn load_share(&self) -> Result<Share> {
        read_json(&self.folder.join(SHARE_FILE))
    }

    /// Remove every file of this network
    pub fn destroy(&self) -> Result<()> {
        if self.folder.exists() {
            std::fs::remove_dir_all(&self.folder)?;
        }
        Ok(())
    }
}

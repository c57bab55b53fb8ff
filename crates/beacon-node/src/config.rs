//! Node configuration assembled from the command line

use anyhow::{Context, Result};
use beacon_core::config::BeaconConfig;
use std::path::{Path, PathBuf};

/// Folder holding one sub-folder per network
pub const NETWORKS_FOLDER: &str = "networks";

/// Everything the daemon needs to run
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root folder: key pair and networks
    pub folder: PathBuf,
    /// Listener for peer calls, also serving the public routes
    pub private_listen: String,
    /// Listener for the public routes only, if any
    pub public_listen: Option<String>,
    /// Listener for control calls, local only
    pub control_listen: String,
    pub beacon: BeaconConfig,
}

impl NodeConfig {
    pub fn networks_dir(&self) -> PathBuf {
        self.folder.join(NETWORKS_FOLDER)
    }
}

/// Read beacon tunables from a JSON file, defaults otherwise
pub fn load_beacon_config(path: Option<&Path>) -> Result<BeaconConfig> {
    let Some(path) = path else {
        return Ok(BeaconConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading beacon config {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing beacon config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_file_name_gives_defaults() {
        assert_eq!(load_beacon_config(None).unwrap(), BeaconConfig::default());
    }

    #[test]
    fn test_beacon_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        std::fs::write(&path, r#"{"catchup_period": 100, "stream_buffer": 8}"#).unwrap();

        let config = load_beacon_config(Some(&path)).unwrap();
        assert_eq!(config.catchup_period, Duration::from_millis(100));
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.dkg_timeout, BeaconConfig::default().dkg_timeout);

        std::fs::write(&path, "not json").unwrap();
        assert!(load_beacon_config(Some(&path)).is_err());
    }
}

//! Tunables shared by every network instance of a node

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-instance beacon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Duration of one DKG phase when not every bundle arrives
    #[serde(with = "millis")]
    pub dkg_timeout: Duration,
    /// Pause between two rebuilt rounds while catching up
    #[serde(with = "millis")]
    pub catchup_period: Duration,
    /// Silence after which a sync moves to the next peer
    #[serde(with = "millis")]
    pub sync_timeout: Duration,
    /// Rounds kept in the partial signature cache behind the last stored one
    pub partial_cache_rounds: u64,
    /// Queue length of one stream subscriber
    pub stream_buffer: usize,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            dkg_timeout: Duration::from_secs(10),
            catchup_period: Duration::from_millis(500),
            sync_timeout: Duration::from_secs(5),
            partial_cache_rounds: 3,
            stream_buffer: 64,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

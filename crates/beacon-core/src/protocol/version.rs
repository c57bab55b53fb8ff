//! Registered protocol versions

use super::{BeaconProcess, Factory, Protocol};
use crate::crypto::Scheme;
use std::sync::Arc;

/// Chained beacons; every legacy network runs it
pub const V1: &str = "V1";
/// Unchained beacons
pub const V2: &str = "V2";

/// Beacon scheme a version signs with
pub fn scheme_of(version: &str) -> Option<Scheme> {
    match version {
        V1 => Some(Scheme::Chained),
        V2 => Some(Scheme::Unchained),
        _ => None,
    }
}

pub(super) fn v1() -> Factory {
    Factory {
        fresh: |config| Ok(Arc::new(BeaconProcess::fresh(V1, Scheme::Chained, config)) as Arc<dyn Protocol>),
        load: |config, folder, legacy| {
            Ok(Arc::new(BeaconProcess::load(V1, Scheme::Chained, config, folder, legacy)?) as Arc<dyn Protocol>)
        },
    }
}

pub(super) fn v2() -> Factory {
    Factory {
        fresh: |config| Ok(Arc::new(BeaconProcess::fresh(V2, Scheme::Unchained, config)) as Arc<dyn Protocol>),
        load: |config, folder, legacy| {
            Ok(Arc::new(BeaconProcess::load(V2, Scheme::Unchained, config, folder, legacy)?) as Arc<dyn Protocol>)
        },
    }
}

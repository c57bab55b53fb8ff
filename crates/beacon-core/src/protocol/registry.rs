//! Version tag to constructor mapping

use super::{version, Protocol, ProtocolConfig, V1, V2};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// Builds an instance with no group yet
pub type FreshFn = fn(ProtocolConfig) -> Result<Arc<dyn Protocol>>;

/// Restores an instance from its folder; the flag marks the legacy folder
pub type LoadFn = fn(ProtocolConfig, &Path, bool) -> Result<Arc<dyn Protocol>>;

/// Constructors of one protocol version
#[derive(Clone, Copy)]
pub struct Factory {
    pub fresh: FreshFn,
    pub load: LoadFn,
}

/// Retired versions no instance may be built from
pub const BLACKLIST: &[&str] = &[];

/// Known protocol versions.
///
/// Built once before the node serves anything; registering a version
/// twice is a programming error and panics.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
    blacklist: BTreeSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every version this release speaks, minus [`BLACKLIST`]
    pub fn standard() -> Self {
        let mut registry = Self::new().with_blacklist(BLACKLIST);
        registry.register(V1, version::v1());
        registry.register(V2, version::v2());
        registry
    }

    pub fn with_blacklist(mut self, versions: &[&str]) -> Self {
        self.blacklist.extend(versions.iter().map(|v| v.to_string()));
        self
    }

    /// Panics if `version` is already registered
    pub fn register(&mut self, version: &str, factory: Factory) {
        if self.factories.contains_key(version) {
            panic!("protocol version {} registered twice", version);
        }
        self.factories.insert(version.to_string(), factory);
    }

    pub fn lookup(&self, version: &str) -> Result<Factory> {
        if self.blacklist.contains(version) {
            return Err(Error::BlacklistedVersion(version.to_string()));
        }
        self.factories
            .get(version)
            .copied()
            .ok_or_else(|| Error::UnknownVersion(version.to_string()))
    }

    /// Usable versions, sorted
    pub fn versions(&self) -> Vec<String> {
        self.factories
            .keys()
            .filter(|v| !self.blacklist.contains(*v))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_versions() {
        let registry = Registry::standard();
        assert_eq!(registry.versions(), vec!["V1".to_string(), "V2".to_string()]);
        assert!(registry.lookup(V1).is_ok());
        assert!(matches!(registry.lookup("V9"), Err(Error::UnknownVersion(v)) if v == "V9"));
    }

    #[test]
    fn test_blacklist_checked_first() {
        let registry = Registry::standard().with_blacklist(&[V1, "V0"]);
        assert!(matches!(registry.lookup(V1), Err(Error::BlacklistedVersion(_))));
        assert!(matches!(registry.lookup("V0"), Err(Error::BlacklistedVersion(_))));
        assert!(registry.lookup(V2).is_ok());
        assert_eq!(registry.versions(), vec!["V2".to_string()]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut registry = Registry::standard();
        registry.register(V2, version::v2());
    }
}

//! Core types shared by every beacon network

use crate::crypto::{self, Scheme};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a running network: the hash of its founding group.
///
/// The empty identifier is what a peer sends when it omits the field.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(Vec<u8>);

impl NetworkId {
    /// Wrap raw identifier bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The "field omitted" identifier
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse a hex encoded identifier
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self(hex::decode(s)?))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", self.to_hex())
    }
}

impl Serialize for NetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NetworkId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for byte fields
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for lists of byte fields
pub mod hex_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items: Vec<String> = Vec::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Public identity of a node: its address and long-term key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Address peers reach this node at
    pub address: String,
    /// Compressed G2 public key
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    /// Self-signature over address and key
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Identity {
    /// Message covered by the self-signature
    pub fn self_sign_message(address: &str, key: &[u8]) -> Vec<u8> {
        crypto::sha256(&[address.as_bytes(), key])
    }

    /// Check the self-signature of this identity
    pub fn valid_signature(&self) -> Result<()> {
        let msg = Self::self_sign_message(&self.address, &self.key);
        crypto::verify(&self.key, &msg, &self.signature)
    }
}

/// A member of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Position in the group, also the share index
    pub index: u32,
    /// Node identity
    pub identity: Identity,
}

impl Node {
    pub fn address(&self) -> &str {
        &self.identity.address
    }
}

/// Commitments to the distributed polynomial; the first one is the
/// combined public key of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistPublic {
    #[serde(with = "hex_bytes_vec")]
    pub coefficients: Vec<Vec<u8>>,
}

impl DistPublic {
    /// Combined public key
    pub fn key(&self) -> &[u8] {
        self.coefficients.first().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Participants, threshold and timing of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Members ordered by index
    pub nodes: Vec<Node>,
    /// Number of partial signatures needed for a beacon
    pub threshold: usize,
    /// Seconds between two rounds
    pub period: u64,
    /// Unix time of round 1
    pub genesis_time: i64,
    /// Hash of the founding group, the network identifier
    #[serde(with = "hex_bytes")]
    pub genesis_seed: Vec<u8>,
    /// Unix time from which this group signs, 0 for the founding group
    #[serde(default)]
    pub transition_time: i64,
    /// Distributed public key, set once the DKG finished
    #[serde(default)]
    pub public_key: Option<DistPublic>,
}

impl Group {
    /// Build a founding group; nodes are sorted by address and indexed
    pub fn new(mut identities: Vec<Identity>, threshold: usize, period: u64, genesis_time: i64) -> Self {
        identities.sort_by(|a, b| a.address.cmp(&b.address));
        let nodes = identities
            .into_iter()
            .enumerate()
            .map(|(i, identity)| Node {
                index: i as u32,
                identity,
            })
            .collect();
        let mut group = Self {
            nodes,
            threshold,
            period,
            genesis_time,
            genesis_seed: Vec::new(),
            transition_time: 0,
            public_key: None,
        };
        group.genesis_seed = group.hash();
        group
    }

    /// Build the group taking over `old` at `transition_time`
    pub fn new_reshare(old: &Group, identities: Vec<Identity>, threshold: usize, transition_time: i64) -> Self {
        let mut group = Self::new(identities, threshold, old.period, old.genesis_time);
        group.genesis_seed = old.genesis_seed.clone();
        group.transition_time = transition_time;
        group
    }

    /// Network identifier derived from the genesis seed
    pub fn id(&self) -> NetworkId {
        NetworkId::new(self.genesis_seed.clone())
    }

    /// Hash over the whole configuration, excluding the genesis seed
    pub fn hash(&self) -> Vec<u8> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        for node in &self.nodes {
            parts.push(node.index.to_be_bytes().to_vec());
            parts.push(node.identity.address.as_bytes().to_vec());
            parts.push(node.identity.key.clone());
        }
        parts.push((self.threshold as u64).to_be_bytes().to_vec());
        parts.push(self.period.to_be_bytes().to_vec());
        parts.push(self.genesis_time.to_be_bytes().to_vec());
        if self.transition_time != 0 {
            parts.push(self.transition_time.to_be_bytes().to_vec());
        }
        if let Some(public) = &self.public_key {
            parts.extend(public.coefficients.iter().cloned());
        }
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        crypto::sha256(&refs)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find the node holding this public key
    pub fn find(&self, identity: &Identity) -> Option<&Node> {
        self.nodes.iter().find(|n| n.identity.key == identity.key)
    }

    /// Node at a given index
    pub fn node(&self, index: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.index == index)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.find(identity).is_some()
    }

    /// Addresses of every member except `own`
    pub fn peers_except(&self, own: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.address() != own)
            .map(|n| n.address().to_string())
            .collect()
    }

    /// Combined public key, errors while the DKG has not finished
    pub fn public_key(&self) -> Result<&DistPublic> {
        self.public_key.as_ref().ok_or(Error::NoGroup)
    }
}

/// This node's private contribution to the group key. Never sent.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    /// Share index, equal to the node index in the group
    #[zeroize(skip)]
    pub index: u32,
    /// Secret scalar, little endian
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
    /// Commitments of the distributed polynomial
    #[zeroize(skip)]
    pub commits: DistPublic,
}

impl Share {
    /// Distributed public key matching this share
    pub fn public(&self) -> DistPublic {
        self.commits.clone()
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("public", &hex::encode(self.commits.key()))
            .finish()
    }
}

/// A completed beacon round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub round: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub previous_signature: Vec<u8>,
}

impl Beacon {
    /// Round 0 entry seeding the chain
    pub fn genesis(seed: &[u8]) -> Self {
        Self {
            round: 0,
            signature: seed.to_vec(),
            previous_signature: Vec::new(),
        }
    }

    /// Public randomness derived from the signature
    pub fn randomness(&self) -> Vec<u8> {
        crypto::sha256(&[&self.signature])
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sig = hex::encode(&self.signature);
        write!(f, "{{ round: {}, sig: {} }}", self.round, &sig[..sig.len().min(10)])
    }
}

/// Public information needed to verify a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub period: u64,
    pub genesis_time: i64,
    #[serde(with = "hex_bytes")]
    pub genesis_seed: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub group_hash: Vec<u8>,
    pub scheme: String,
}

impl ChainInfo {
    pub fn new(group: &Group, scheme: Scheme) -> Result<Self> {
        Ok(Self {
            public_key: group.public_key()?.key().to_vec(),
            period: group.period,
            genesis_time: group.genesis_time,
            genesis_seed: group.genesis_seed.clone(),
            group_hash: group.hash(),
            scheme: scheme.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(address: &str) -> Identity {
        Identity {
            address: address.to_string(),
            key: vec![1, 2, 3],
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_network_id_hex() {
        let id = NetworkId::new(vec![0xde, 0xad]);
        assert_eq!(id.to_string(), "dead");
        assert_eq!(NetworkId::from_hex("dead").unwrap(), id);
        assert!(NetworkId::empty().is_empty());

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"dead\"");
    }

    #[test]
    fn test_group_sorted_and_seeded() {
        let group = Group::new(vec![identity("c:1"), identity("a:1"), identity("b:1")], 2, 30, 1000);
        let addrs: Vec<_> = group.nodes.iter().map(|n| n.address()).collect();
        assert_eq!(addrs, vec!["a:1", "b:1", "c:1"]);
        assert_eq!(group.nodes[2].index, 2);
        assert_eq!(group.genesis_seed, group.hash());
        assert_eq!(group.id().as_bytes(), group.genesis_seed.as_slice());
    }

    #[test]
    fn test_reshare_keeps_seed() {
        let old = Group::new(vec![identity("a:1"), identity("b:1")], 2, 30, 1000);
        let new = Group::new_reshare(&old, vec![identity("c:1"), identity("b:1")], 2, 1300);
        assert_eq!(new.genesis_seed, old.genesis_seed);
        assert_eq!(new.genesis_time, old.genesis_time);
        assert_ne!(new.hash(), old.hash());
    }

    #[test]
    fn test_peers_except() {
        let group = Group::new(vec![identity("a:1"), identity("b:1")], 2, 30, 1000);
        assert_eq!(group.peers_except("a:1"), vec!["b:1".to_string()]);
    }
}

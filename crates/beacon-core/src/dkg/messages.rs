//! DKG bundles exchanged between participants

use crate::crypto;
use crate::types::{hex_bytes, hex_bytes_vec};
use serde::{Deserialize, Serialize};

/// Encrypted evaluation of a dealer polynomial for one share holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub share_index: u32,
    #[serde(with = "hex_bytes")]
    pub encrypted_share: Vec<u8>,
}

/// Everything one dealer sends during the deal phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealBundle {
    pub dealer_index: u32,
    /// Commitments to the dealer polynomial
    #[serde(with = "hex_bytes_vec")]
    pub commits: Vec<Vec<u8>>,
    pub deals: Vec<Deal>,
    #[serde(with = "hex_bytes")]
    pub session_id: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl DealBundle {
    /// Bytes covered by the dealer signature
    pub fn hash(&self) -> Vec<u8> {
        let mut parts: Vec<Vec<u8>> = vec![b"deal".to_vec(), self.dealer_index.to_be_bytes().to_vec()];
        parts.extend(self.commits.iter().cloned());
        for deal in &self.deals {
            parts.push(deal.share_index.to_be_bytes().to_vec());
            parts.push(deal.encrypted_share.clone());
        }
        parts.push(self.session_id.clone());
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        crypto::sha256(&refs)
    }
}

/// Verdict of a share holder on one dealer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Approved,
    Complaint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub dealer_index: u32,
    pub status: Status,
}

/// Everything one share holder sends during the response phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBundle {
    pub share_index: u32,
    pub responses: Vec<Response>,
    #[serde(with = "hex_bytes")]
    pub session_id: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl ResponseBundle {
    /// Bytes covered by the holder signature
    pub fn hash(&self) -> Vec<u8> {
        let mut parts: Vec<Vec<u8>> = vec![b"response".to_vec(), self.share_index.to_be_bytes().to_vec()];
        for response in &self.responses {
            parts.push(response.dealer_index.to_be_bytes().to_vec());
            parts.push(vec![matches!(response.status, Status::Approved) as u8]);
        }
        parts.push(self.session_id.clone());
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        crypto::sha256(&refs)
    }

    /// Whether this holder complained about `dealer`
    pub fn complains_about(&self, dealer: u32) -> bool {
        self.responses
            .iter()
            .any(|r| r.dealer_index == dealer && r.status == Status::Complaint)
    }
}

/// Any DKG message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bundle {
    Deal(DealBundle),
    Response(ResponseBundle),
}

impl Bundle {
    pub fn session_id(&self) -> &[u8] {
        match self {
            Bundle::Deal(d) => &d.session_id,
            Bundle::Response(r) => &r.session_id,
        }
    }
}

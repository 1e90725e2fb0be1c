//! Votes and per-item tallies

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consensus::Quorum;
use crate::item::ItemId;
use crate::network::NodeId;
use crate::signing::VoteSigner;

/// A node's signed opinion on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub item_id: ItemId,
    pub voter: NodeId,
    pub positive: bool,
    pub signature: Vec<u8>,
}

impl Vote {
    /// Bytes covered by the signature.
    pub fn signing_payload(item_id: &ItemId, voter: NodeId, positive: bool) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 4 + 1);
        payload.extend_from_slice(item_id.as_bytes());
        payload.extend_from_slice(&voter.0.to_be_bytes());
        payload.push(u8::from(positive));
        payload
    }

    pub fn signed(signer: &dyn VoteSigner, item_id: ItemId, positive: bool) -> Self {
        let voter = signer.local_id();
        let signature = signer.sign(&Self::signing_payload(&item_id, voter, positive));
        Self {
            item_id,
            voter,
            positive,
            signature,
        }
    }

    pub fn verify(&self, signer: &dyn VoteSigner) -> bool {
        signer.verify(
            self.voter,
            &Self::signing_payload(&self.item_id, self.voter, self.positive),
            &self.signature,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Decline,
}

/// Votes received for one item, at most one per voter.
#[derive(Debug, Default, Clone)]
pub struct VoteTally {
    votes: BTreeMap<NodeId, bool>,
    positive: usize,
    negative: usize,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. Returns false if the voter had already voted; the first
    /// vote from a voter is the one that counts.
    pub fn record(&mut self, voter: NodeId, positive: bool) -> bool {
        if self.votes.contains_key(&voter) {
            return false;
        }
        self.votes.insert(voter, positive);
        if positive {
            self.positive += 1;
        } else {
            self.negative += 1;
        }
        true
    }

    pub fn positive(&self) -> usize {
        self.positive
    }

    pub fn negative(&self) -> usize {
        self.negative
    }

    pub fn has_voted(&self, voter: NodeId) -> bool {
        self.votes.contains_key(&voter)
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.votes.keys().copied()
    }

    /// The side that reached its threshold. When the latest vote tipped a
    /// side, that side is checked first, so the first threshold crossed wins.
    pub fn decision(&self, quorum: &Quorum, latest_positive: bool) -> Option<Decision> {
        let approve = self.positive >= quorum.positive;
        let decline = self.negative >= quorum.negative;
        match (approve, decline) {
            (true, true) if latest_positive => Some(Decision::Approve),
            (true, true) => Some(Decision::Decline),
            (true, false) => Some(Decision::Approve),
            (false, true) => Some(Decision::Decline),
            (false, false) => None,
        }
    }
}

//! Consensus thresholds and runtime settings
//!
//! Thresholds are derived from the network size and normalized so that
//! `positive + negative < total` and `resync_break + positive < total` hold
//! whenever the network is large enough for that to be possible (three or
//! more nodes).
//!
//! Settings are immutable snapshots published through a versioned
//! [`SettingsHandle`]. Processors take a snapshot when they start; a
//! reconfiguration only affects processors started afterwards.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub total_nodes: usize,
    pub positive: usize,
    pub negative: usize,
    pub resync_break: usize,
}

impl Quorum {
    /// Default thresholds for a network of `total_nodes`.
    pub fn for_network(total_nodes: usize) -> Self {
        Self::with_overrides(total_nodes, None, None, None)
    }

    /// Derived thresholds with explicit overrides, then normalized.
    ///
    /// `positive` defaults to `max(n / 2 + 1, floor(2n / 3))`, a strict
    /// majority that two conflicting approvals cannot both reach.
    pub fn with_overrides(
        total_nodes: usize,
        positive: Option<usize>,
        negative: Option<usize>,
        resync_break: Option<usize>,
    ) -> Self {
        let n = total_nodes.max(1);
        Self {
            total_nodes: n,
            positive: positive.unwrap_or_else(|| (n / 2 + 1).max(n * 2 / 3)),
            negative: negative.unwrap_or_else(|| (n * 11).div_ceil(100)),
            resync_break: resync_break.unwrap_or_else(|| (n * 20).div_ceil(100)),
        }
        .normalized()
    }

    /// Lower `negative` first, then `positive`, never below one, until the
    /// invariants hold.
    pub fn normalized(mut self) -> Self {
        let n = self.total_nodes.max(1);
        self.total_nodes = n;
        self.positive = self.positive.clamp(1, n);
        self.negative = self.negative.clamp(1, n);
        self.resync_break = self.resync_break.clamp(1, n);

        while self.positive + self.negative >= n && self.negative > 1 {
            self.negative -= 1;
        }
        while self.positive + self.negative >= n && self.positive > 1 {
            self.positive -= 1;
        }
        while self.resync_break + self.positive >= n && self.resync_break > 1 {
            self.resync_break -= 1;
        }
        while self.resync_break + self.positive >= n && self.positive > 1 {
            self.positive -= 1;
        }
        self
    }

    pub fn is_consistent(&self) -> bool {
        self.positive + self.negative < self.total_nodes && self.resync_break + self.positive < self.total_nodes
    }
}

/// Immutable snapshot of everything a processor needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusSettings {
    pub version: u64,
    pub quorum: Quorum,
    /// Deadline for reaching a decision, measured from processor start.
    pub max_election_time: Duration,
    /// How often a pending processor re-sends its vote to silent peers.
    pub vote_resend_interval: Duration,
    /// How long a resync waits for answers.
    pub resync_time: Duration,
    pub max_resync_attempts: u32,
    /// Accept standalone registrations without a paying parcel.
    pub free_registrations: bool,
}

impl ConsensusSettings {
    pub fn for_network(total_nodes: usize) -> Self {
        Self {
            version: 0,
            quorum: Quorum::for_network(total_nodes),
            max_election_time: Duration::from_secs(15),
            vote_resend_interval: Duration::from_millis(1000),
            resync_time: Duration::from_secs(5),
            max_resync_attempts: 3,
            free_registrations: false,
        }
    }
}

/// Versioned publisher of [`ConsensusSettings`].
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Arc<ConsensusSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: ConsensusSettings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<ConsensusSettings> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConsensusSettings>> {
        self.tx.subscribe()
    }

    /// Publish a modified copy of the current settings with a bumped version.
    pub fn update(&self, change: impl FnOnce(&mut ConsensusSettings)) -> Arc<ConsensusSettings> {
        let mut next = (*self.current()).clone();
        change(&mut next);
        next.quorum = next.quorum.normalized();
        next.version += 1;
        let next = Arc::new(next);
        self.tx.send_replace(next.clone());
        info!(
            version = next.version,
            total = next.quorum.total_nodes,
            positive = next.quorum.positive,
            negative = next.quorum.negative,
            resync_break = next.quorum.resync_break,
            "Consensus settings updated"
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_node_thresholds() {
        let q = Quorum::for_network(8);
        assert_eq!((q.positive, q.negative, q.resync_break), (5, 1, 2));
        assert!(q.is_consistent());
    }

    #[test]
    fn test_small_networks() {
        let q = Quorum::for_network(4);
        assert_eq!((q.positive, q.negative, q.resync_break), (2, 1, 1));
        assert!(q.is_consistent());

        let q = Quorum::for_network(5);
        assert_eq!((q.positive, q.negative, q.resync_break), (3, 1, 1));

        let single = Quorum::for_network(1);
        assert_eq!((single.positive, single.negative, single.resync_break), (1, 1, 1));
        assert!(!single.is_consistent());
    }

    #[test]
    fn test_two_thirds_rounds_down() {
        let q = Quorum::for_network(10);
        assert_eq!((q.positive, q.negative, q.resync_break), (6, 2, 2));

        let q = Quorum::for_network(9);
        assert_eq!(q.positive, 6);
    }

    #[test]
    fn test_invariants_hold_from_three_nodes() {
        for n in 3..200 {
            let q = Quorum::for_network(n);
            assert!(q.is_consistent(), "n={} {:?}", n, q);
            assert!(q.positive > n / 2 || n < 5, "n={} {:?}", n, q);
        }
    }

    #[test]
    fn test_overrides_are_normalized() {
        let q = Quorum::with_overrides(8, Some(5), Some(6), Some(7));
        assert!(q.is_consistent());
        assert_eq!(q.positive, 5);
        assert_eq!(q.negative, 2);
        assert_eq!(q.resync_break, 2);

        let q = Quorum::with_overrides(10, Some(20), None, None);
        assert!(q.is_consistent());
    }

    #[test]
    fn test_handle_bumps_version() {
        let handle = SettingsHandle::new(ConsensusSettings::for_network(4));
        let mut rx = handle.subscribe();
        assert_eq!(handle.current().version, 0);

        let next = handle.update(|s| s.quorum = Quorum::for_network(8));
        assert_eq!(next.version, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().quorum.positive, 5);
        assert_eq!(handle.current().quorum.total_nodes, 8);
    }
}

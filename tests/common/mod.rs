//! Multi-node simulation harness over the in-process network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use ledger_node::consensus::{ConsensusSettings, SettingsHandle};
use ledger_node::item::{BasicCheck, Item, ItemCheck, ItemId};
use ledger_node::ledger::{ItemResult, ItemState, Ledger, LedgerOptions};
use ledger_node::network::{LocalNetwork, NodeId};
use ledger_node::node::{Node, NodeParts};
use ledger_node::signing::Ed25519Signer;

pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings short enough for tests; free registrations on.
pub fn fast_settings(total_nodes: usize) -> ConsensusSettings {
    ConsensusSettings {
        max_election_time: Duration::from_secs(2),
        vote_resend_interval: Duration::from_millis(100),
        resync_time: Duration::from_millis(500),
        max_resync_attempts: 2,
        free_registrations: true,
        ..ConsensusSettings::for_network(total_nodes)
    }
}

/// Default ledger options with a short retry budget.
pub fn test_ledger_options() -> LedgerOptions {
    let mut options = LedgerOptions::default();
    options.retry.max_attempts = 3;
    options
}

pub struct TestNetwork {
    pub network: LocalNetwork,
    pub members: Vec<NodeId>,
    pub ledgers: Vec<Arc<Ledger>>,
    pub nodes: Vec<Arc<Node>>,
    keys: Vec<SigningKey>,
    settings: ConsensusSettings,
    checker: Arc<dyn ItemCheck>,
    dirs: Vec<TempDir>,
    max_processors: usize,
}

impl TestNetwork {
    /// Create ledgers and keys for `n` nodes without starting them, so tests
    /// can seed ledgers first.
    pub fn prepare(n: usize, settings: ConsensusSettings) -> Self {
        let members: Vec<NodeId> = (0..n as u32).map(NodeId).collect();
        let mut dirs = Vec::new();
        let mut ledgers = Vec::new();
        for _ in 0..n {
            let dir = TempDir::new().unwrap();
            let ledger = Ledger::open(&dir.path().join("ledger.db"), test_ledger_options()).unwrap();
            ledgers.push(Arc::new(ledger));
            dirs.push(dir);
        }
        let keys = (0..n).map(|i| SigningKey::from_bytes(&[i as u8 + 1; 32])).collect();

        Self {
            network: LocalNetwork::new(),
            members,
            ledgers,
            nodes: Vec::new(),
            keys,
            settings,
            checker: Arc::new(BasicCheck),
            dirs,
            max_processors: 64,
        }
    }

    /// Prepare and start `n` nodes.
    pub fn start(n: usize, settings: ConsensusSettings) -> Self {
        let mut net = Self::prepare(n, settings);
        net.start_all();
        net
    }

    pub fn with_checker(mut self, checker: Arc<dyn ItemCheck>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_max_processors(mut self, max_processors: usize) -> Self {
        self.max_processors = max_processors;
        self
    }

    pub fn ledger_path(&self, i: usize) -> PathBuf {
        self.dirs[i].path().join("ledger.db")
    }

    pub fn start_all(&mut self) {
        self.nodes = (0..self.members.len()).map(|i| self.start_node(i)).collect();
    }

    fn start_node(&self, i: usize) -> Arc<Node> {
        let id = self.members[i];
        let (channel, inbound) = self.network.join(id, &self.members);
        let peer_keys: HashMap<NodeId, _> = self
            .members
            .iter()
            .zip(&self.keys)
            .map(|(member, key)| (*member, key.verifying_key()))
            .collect();
        let signer = Ed25519Signer::new(id, self.keys[i].clone(), peer_keys);

        Node::start(NodeParts {
            node_id: id,
            ledger: self.ledgers[i].clone(),
            channel,
            inbound,
            signer: Arc::new(signer),
            checker: self.checker.clone(),
            settings: SettingsHandle::new(self.settings.clone()),
            is_testnet: true,
            max_processors: self.max_processors,
        })
    }

    /// Stop node `i` and start it again on the same ledger.
    pub fn restart(&mut self, i: usize) {
        self.nodes[i].shutdown();
        self.nodes[i] = self.start_node(i);
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    pub fn set_online(&self, i: usize, online: bool) {
        self.network.set_online(self.members[i], online);
    }
}

pub fn item(body: &str) -> Item {
    let now = Utc::now();
    Item::new(body.as_bytes().to_vec(), now, now + chrono::Duration::days(30))
}

/// Poll `node` until `item_id` reaches `state` or `timeout` passes.
pub async fn wait_for_state(node: &Node, item_id: &ItemId, state: ItemState, timeout: Duration) -> ItemResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let result = node.get_state(item_id).await.unwrap();
        if result.state == state || tokio::time::Instant::now() >= deadline {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll `node` until `item_id` is no longer being voted on.
pub async fn settled(node: &Node, item_id: &ItemId, timeout: Duration) -> ItemResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let result = node.wait_item(item_id, timeout).await.unwrap();
        let voting = matches!(
            result.state,
            ItemState::Pending | ItemState::PendingPositive | ItemState::PendingNegative
        );
        if !voting || tokio::time::Instant::now() >= deadline {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll `node` until `item_id` reaches a terminal state here.
pub async fn decided(node: &Node, item_id: &ItemId, timeout: Duration) -> ItemResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let result = settled(node, item_id, timeout).await;
        if result.state.is_terminal() || tokio::time::Instant::now() >= deadline {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

//! Node configuration

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consensus::{ConsensusSettings, Quorum};
use crate::error::ConfigError;
use crate::ledger::{LedgerOptions, RetryPolicy};
use crate::network::{NodeId, TransportSettings};
use crate::signing::parse_verifying_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Every other node in the network
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node number, unique in the network
    pub id: u32,

    /// Data directory (ledger database, node key)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Report results as coming from a test network
    #[serde(default)]
    pub is_testnet: bool,

    /// Maximum number of items voted on concurrently
    #[serde(default = "default_max_processors")]
    pub max_processors: usize,

    /// Hex Ed25519 secret key; generated under data_dir when absent
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Network size; defaults to the number of peers plus this node
    #[serde(default)]
    pub total_nodes: Option<usize>,

    /// Threshold overrides, normalized against the network size
    #[serde(default)]
    pub positive: Option<usize>,
    #[serde(default)]
    pub negative: Option<usize>,
    #[serde(default)]
    pub resync_break: Option<usize>,

    /// Per-item deadline in milliseconds
    #[serde(default = "default_max_election_time")]
    pub max_election_time_ms: u64,

    #[serde(default = "default_vote_resend_interval")]
    pub vote_resend_interval_ms: u64,

    /// How long a resync collects answers
    #[serde(default = "default_resync_time")]
    pub resync_time_ms: u64,

    #[serde(default = "default_max_resync_attempts")]
    pub max_resync_attempts: u32,

    /// Accept standalone registrations without a payment
    #[serde(default)]
    pub free_registrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Ledger database file, relative to the data directory
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,

    /// Attempts for a ledger operation that fails transiently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Lifetime of a freshly created pending record
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_retransmit_interval")]
    pub retransmit_interval_ms: u64,

    /// Retransmissions before a peer is treated as unreachable
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Inbound messages queued for the dispatcher
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    /// host:port of the peer's UDP listener
    pub address: String,
    /// Hex Ed25519 verifying key
    pub public_key: String,
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/ledger-node") }
fn default_max_processors() -> usize { num_cpus::get() * 32 }
fn default_max_election_time() -> u64 { 15_000 }
fn default_vote_resend_interval() -> u64 { 1_000 }
fn default_resync_time() -> u64 { 5_000 }
fn default_max_resync_attempts() -> u32 { 3 }
fn default_ledger_file() -> String { "ledger.db".to_string() }
fn default_max_retries() -> u32 { 5 }
fn default_retry_base_delay() -> u64 { 50 }
fn default_pending_ttl() -> u64 { 300 }
fn default_listen_addr() -> String { "0.0.0.0:2052".to_string() }
fn default_retransmit_interval() -> u64 { 250 }
fn default_max_retransmits() -> u32 { 8 }
fn default_max_datagram_size() -> usize { 65_000 }
fn default_inbound_queue() -> usize { 1024 }

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            total_nodes: None,
            positive: None,
            negative: None,
            resync_break: None,
            max_election_time_ms: default_max_election_time(),
            vote_resend_interval_ms: default_vote_resend_interval(),
            resync_time_ms: default_resync_time(),
            max_resync_attempts: default_max_resync_attempts(),
            free_registrations: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_file: default_ledger_file(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            retransmit_interval_ms: default_retransmit_interval(),
            max_retransmits: default_max_retransmits(),
            max_datagram_size: default_max_datagram_size(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                data_dir: default_data_dir(),
                is_testnet: false,
                max_processors: default_max_processors(),
                secret_key: None,
            },
            consensus: ConsensusConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            peers: vec![],
        }
    }
}

impl Config {
    /// Load `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node.id {
                return Err(ConfigError::Invalid(format!("peer {} has this node's id", peer.id)));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::Invalid(format!("peer {} listed twice", peer.id)));
            }
            peer.socket_addr()?;
            parse_verifying_key(&peer.public_key)?;
        }
        self.network
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidAddress(format!("{}: {}", self.network.listen_addr, e)))?;

        let total = self.total_nodes();
        if total < self.peers.len() + 1 {
            return Err(ConfigError::Invalid(format!(
                "total_nodes {} is smaller than the {} configured nodes",
                total,
                self.peers.len() + 1
            )));
        }
        for (name, value) in [
            ("positive", self.consensus.positive),
            ("negative", self.consensus.negative),
            ("resync_break", self.consensus.resync_break),
        ] {
            if value.is_some_and(|v| v == 0 || v > total) {
                return Err(ConfigError::Invalid(format!("{} must be between 1 and {}", name, total)));
            }
        }
        if self.consensus.max_election_time_ms == 0 || self.consensus.resync_time_ms == 0 {
            return Err(ConfigError::Invalid("election and resync times must be positive".into()));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node.id)
    }

    pub fn total_nodes(&self) -> usize {
        self.consensus.total_nodes.unwrap_or(self.peers.len() + 1)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.storage.ledger_file)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e| ConfigError::InvalidAddress(format!("{}: {}", self.network.listen_addr, e)))
    }

    pub fn consensus_settings(&self) -> ConsensusSettings {
        let c = &self.consensus;
        ConsensusSettings {
            version: 0,
            quorum: Quorum::with_overrides(self.total_nodes(), c.positive, c.negative, c.resync_break),
            max_election_time: Duration::from_millis(c.max_election_time_ms),
            vote_resend_interval: Duration::from_millis(c.vote_resend_interval_ms),
            resync_time: Duration::from_millis(c.resync_time_ms),
            max_resync_attempts: c.max_resync_attempts,
            free_registrations: c.free_registrations,
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            retry: RetryPolicy {
                max_attempts: self.storage.max_retries,
                base_delay: Duration::from_millis(self.storage.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            pending_ttl: chrono::Duration::seconds(self.storage.pending_ttl_secs as i64),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            retransmit_interval: Duration::from_millis(self.network.retransmit_interval_ms),
            max_retransmits: self.network.max_retransmits,
            max_datagram_size: self.network.max_datagram_size,
            inbound_queue: self.network.inbound_queue,
        }
    }

    /// Verifying keys of every configured peer.
    pub fn peer_keys(&self) -> Result<HashMap<NodeId, VerifyingKey>, ConfigError> {
        self.peers
            .iter()
            .map(|peer| Ok((NodeId(peer.id), parse_verifying_key(&peer.public_key)?)))
            .collect()
    }
}

impl PeerConfig {
    /// Resolve `address`, which may be a host name.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        use std::net::ToSocketAddrs;
        self.address
            .to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(format!("{}: {}", self.address, e)))?
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(self.address.clone()))
    }
}

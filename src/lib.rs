//! ledger-node: consensus core of a permissioned ledger node
//!
//! Every node votes on submitted items, keeps a durable record of each
//! item's lifecycle state, and recovers missed decisions from its peers.
//!
//! - [`ledger`]: SQLite store of item states, locks and side data
//! - [`processor`]: per-item voting, parcels, and resync
//! - [`network`]: peer messages over UDP or an in-process hub
//! - [`node`]: the node runtime and its client operations

pub mod config;
pub mod consensus;
pub mod error;
pub mod item;
pub mod ledger;
pub mod network;
pub mod node;
pub mod processor;
pub mod signing;
pub mod vote;

pub use config::Config;
pub use consensus::{ConsensusSettings, Quorum, SettingsHandle};
pub use error::{ConfigError, ItemError, LedgerError, NetworkError, NodeError};
pub use item::{BasicCheck, ErrorCode, ErrorRecord, Item, ItemCheck, ItemId, Parcel, Transaction};
pub use ledger::{ItemResult, ItemState, Ledger, LedgerOptions, StateRecord};
pub use network::{LocalNetwork, NodeId, PeerChannel, PeerMessage, UdpChannel};
pub use node::{Node, NodeParts, SanitationReport};
pub use processor::ResyncOutcome;
pub use signing::{Ed25519Signer, VoteSigner};
pub use vote::{Vote, VoteTally};

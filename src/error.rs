//! Error types for ledger-node
//!
//! Only storage, transport and configuration failures are Rust errors. Domain
//! outcomes (validation failures, lock conflicts, vote timeouts) travel as
//! [`ErrorRecord`](crate::item::ErrorRecord)s inside an `ItemResult`.

use thiserror::Error;

use crate::item::ItemId;
use crate::ledger::ItemState;
use crate::network::NodeId;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Illegal transition for {item}: {from} -> {to}")]
    IllegalTransition {
        item: ItemId,
        from: ItemState,
        to: ItemState,
    },

    #[error("Record for {0} is final and cannot be destroyed")]
    FinalRecord(ItemId),

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("Ledger connection poisoned")]
    Poisoned,

    #[error("Storage retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<LedgerError>,
    },
}

impl LedgerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Busy(_) | LedgerError::Io(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                LedgerError::Busy(e.to_string())
            }
            _ => LedgerError::Database(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum ItemError {
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid item id: {0}")]
    InvalidId(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: ItemId, actual: ItemId },

    #[error("Bad structure: {0}")]
    Structure(String),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Peer unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Peer queue full: {0}")]
    QueueFull(NodeId),

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Item error: {0}")]
    Item(#[from] ItemError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Node is shutting down")]
    ShuttingDown,
}

//! Ledger records and their client-facing projection

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::ItemState;
use crate::item::{ErrorRecord, ItemId};

/// One row of the ledger. `record_id` is assigned by storage and is what
/// lock holders point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub record_id: i64,
    pub item_id: ItemId,
    pub state: ItemState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub locked_by_record_id: Option<i64>,
}

impl StateRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A record is locked exactly when it names its holder.
    pub fn lock_is_consistent(&self) -> bool {
        self.state.is_locked() == self.locked_by_record_id.is_some()
    }
}

/// Snapshot of an item's state as reported to clients and peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub state: ItemState,
    pub have_copy: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub locked_by_id: Option<ItemId>,
    #[serde(default)]
    pub is_testnet: bool,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ItemResult {
    pub fn undefined() -> Self {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_default();
        Self {
            state: ItemState::Undefined,
            have_copy: false,
            created_at: epoch,
            expires_at: epoch,
            errors: Vec::new(),
            locked_by_id: None,
            is_testnet: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn from_record(record: &StateRecord, have_copy: bool) -> Self {
        Self {
            state: record.state,
            have_copy,
            created_at: record.created_at,
            expires_at: record.expires_at,
            errors: Vec::new(),
            locked_by_id: None,
            is_testnet: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<ErrorRecord>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_testnet(mut self, is_testnet: bool) -> Self {
        self.is_testnet = is_testnet;
        self
    }
}

impl PartialEq for ItemResult {
    /// Timestamps compare at whole-second precision.
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.have_copy == other.have_copy
            && self.is_testnet == other.is_testnet
            && self.created_at.timestamp() == other.created_at.timestamp()
            && self.expires_at.timestamp() == other.expires_at.timestamp()
    }
}

impl Default for ItemResult {
    fn default() -> Self {
        Self::undefined()
    }
}

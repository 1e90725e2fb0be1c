//! Items and transactions
//!
//! An item is an opaque signed object identified by the SHA-256 of its packed
//! form. A [`Transaction`] is a flat arena of items: a root plus the items it
//! creates, referenced from each other only by [`ItemId`].
//!
//! The core only needs the identifiers an item revokes, creates and
//! references; everything else in the body is application payload checked by
//! an [`ItemCheck`] collaborator.

mod parcel;

pub use parcel::Parcel;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ItemError;

// =============================================================================
// Identity
// =============================================================================

/// Content hash of a packed item.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId([u8; 32]);

impl ItemId {
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ItemError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ItemError::InvalidId(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.short())
    }
}

impl FromStr for ItemId {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ItemError::InvalidId(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

// =============================================================================
// Items
// =============================================================================

/// A single object revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// First revision of the logical object; `None` when this item is the origin.
    pub origin: Option<ItemId>,
    pub parent: Option<ItemId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Approved items this revision replaces.
    pub revoking: Vec<ItemId>,
    /// Items created together with this one; must be present in the transaction.
    pub new_items: Vec<ItemId>,
    /// Items that must already be approved for this one to be valid.
    pub references: Vec<ItemId>,
    /// Side data kept alongside the approved revision, unique per origin.
    pub environment: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

impl Item {
    pub fn new(body: impl Into<Vec<u8>>, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            origin: None,
            parent: None,
            created_at,
            expires_at,
            revoking: Vec::new(),
            new_items: Vec::new(),
            references: Vec::new(),
            environment: None,
            body: body.into(),
        }
    }

    /// Start a revision of `previous`: same origin, revokes `previous`.
    pub fn revision_of(previous: &Item, body: impl Into<Vec<u8>>) -> Result<Self, ItemError> {
        let previous_id = previous.id()?;
        let mut next = Item::new(body, Utc::now(), previous.expires_at);
        next.origin = Some(previous.origin_or(previous_id));
        next.parent = Some(previous_id);
        next.revoking.push(previous_id);
        Ok(next)
    }

    pub fn with_environment(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.environment = Some(data.into());
        self
    }

    pub fn pack(&self) -> Result<Vec<u8>, ItemError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn id(&self) -> Result<ItemId, ItemError> {
        Ok(ItemId::digest(&self.pack()?))
    }

    pub fn origin_or(&self, own: ItemId) -> ItemId {
        self.origin.unwrap_or(own)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Root item plus every item it creates, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    root: ItemId,
    items: BTreeMap<ItemId, Item>,
}

#[derive(Serialize, Deserialize)]
struct PackedTransaction {
    root: Vec<u8>,
    new_items: Vec<Vec<u8>>,
}

impl Transaction {
    /// Build a transaction from a root and its (transitively) created items.
    pub fn new(root: Item, new_items: Vec<Item>) -> Result<Self, ItemError> {
        let root_id = root.id()?;
        let mut items = BTreeMap::new();
        items.insert(root_id, root);
        for item in new_items {
            items.insert(item.id()?, item);
        }
        let tx = Self { root: root_id, items };
        tx.validate_structure()?;
        Ok(tx)
    }

    pub fn single(root: Item) -> Result<Self, ItemError> {
        Self::new(root, Vec::new())
    }

    pub fn root_id(&self) -> ItemId {
        self.root
    }

    pub fn root(&self) -> &Item {
        // root is always inserted by every constructor
        &self.items[&self.root]
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = (&ItemId, &Item)> {
        self.items.iter()
    }

    /// Ids created by this transaction, excluding the root.
    pub fn new_item_ids(&self) -> BTreeSet<ItemId> {
        self.items.keys().filter(|id| **id != self.root).copied().collect()
    }

    /// Ids revoked anywhere in the transaction.
    pub fn revoking_ids(&self) -> BTreeSet<ItemId> {
        self.items.values().flat_map(|item| item.revoking.iter().copied()).collect()
    }

    /// Ids referenced anywhere in the transaction that it does not create itself.
    pub fn reference_ids(&self) -> BTreeSet<ItemId> {
        self.items
            .values()
            .flat_map(|item| item.references.iter().copied())
            .filter(|id| !self.items.contains_key(id))
            .collect()
    }

    /// Latest expiry across the transaction.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.items
            .values()
            .map(|item| item.expires_at)
            .max()
            .unwrap_or_else(|| self.root().expires_at)
    }

    /// The new-item graph must be a tree hanging off the root: every listed
    /// item present, each created exactly once, no cycles, nothing both
    /// created and revoked.
    pub fn validate_structure(&self) -> Result<(), ItemError> {
        let mut parent_of: BTreeMap<ItemId, ItemId> = BTreeMap::new();
        for (id, item) in &self.items {
            for child in &item.new_items {
                if !self.items.contains_key(child) {
                    return Err(ItemError::Structure(format!("new item {} missing", child.short())));
                }
                if *child == self.root || child == id {
                    return Err(ItemError::Structure(format!("item {} creates itself", child.short())));
                }
                if parent_of.insert(*child, *id).is_some() {
                    return Err(ItemError::Structure(format!(
                        "item {} created more than once",
                        child.short()
                    )));
                }
            }
        }

        // every non-root item must reach the root by following parents
        for id in self.items.keys().filter(|id| **id != self.root) {
            let mut current = *id;
            let mut steps = 0;
            while current != self.root {
                current = *parent_of.get(&current).ok_or_else(|| {
                    ItemError::Structure(format!("item {} is not created by the root", id.short()))
                })?;
                steps += 1;
                if steps > self.items.len() {
                    return Err(ItemError::Structure("cycle in new items".into()));
                }
            }
        }

        let revoked = self.revoking_ids();
        if let Some(id) = revoked.iter().find(|id| self.items.contains_key(*id)) {
            return Err(ItemError::Structure(format!("item {} both created and revoked", id.short())));
        }
        Ok(())
    }

    pub fn pack(&self) -> Result<Vec<u8>, ItemError> {
        let packed = PackedTransaction {
            root: self.root().pack()?,
            new_items: self
                .items
                .iter()
                .filter(|(id, _)| **id != self.root)
                .map(|(_, item)| item.pack())
                .collect::<Result<_, _>>()?,
        };
        Ok(rmp_serde::to_vec_named(&packed)?)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, ItemError> {
        let packed: PackedTransaction = rmp_serde::from_slice(bytes)?;
        let root: Item = rmp_serde::from_slice(&packed.root)?;
        let new_items = packed
            .new_items
            .iter()
            .map(|raw| rmp_serde::from_slice::<Item>(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let tx = Self::new(root, new_items)?;
        if ItemId::digest(&packed.root) != tx.root {
            return Err(ItemError::HashMismatch {
                expected: ItemId::digest(&packed.root),
                actual: tx.root,
            });
        }
        Ok(tx)
    }
}

// =============================================================================
// Validation collaborator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Failure,
    BadValue,
    BadStructure,
    Expired,
    LockConflict,
    BadReference,
    Payment,
    FreeRegistration,
    QuorumTimeout,
    Storage,
}

/// Human-readable reason attached to an `ItemResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub object: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            object: object.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}]: {}", self.code, self.object, self.message)
    }
}

/// Application-level validation of a transaction (signatures, permissions,
/// contract rules). Returns the reasons for rejection.
pub trait ItemCheck: Send + Sync + 'static {
    fn check(&self, tx: &Transaction) -> Result<(), Vec<ErrorRecord>>;
}

/// Checks only what the core itself can see: structure and expiry.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCheck;

impl ItemCheck for BasicCheck {
    fn check(&self, tx: &Transaction) -> Result<(), Vec<ErrorRecord>> {
        let mut errors = Vec::new();
        if let Err(e) = tx.validate_structure() {
            errors.push(ErrorRecord::new(ErrorCode::BadStructure, tx.root_id().short(), e.to_string()));
        }
        let now = Utc::now();
        for (id, item) in tx.items() {
            if item.expires_at <= now {
                errors.push(ErrorRecord::new(ErrorCode::Expired, id.short(), "item has expired"));
            }
            if item.created_at > item.expires_at {
                errors.push(ErrorRecord::new(
                    ErrorCode::BadValue,
                    id.short(),
                    "created after expiry",
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(body: &str) -> Item {
        let now = Utc::now();
        Item::new(body.as_bytes(), now, now + Duration::days(1))
    }

    #[test]
    fn test_id_hex_roundtrip() {
        let id = ItemId::digest(b"hello");
        let parsed: ItemId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
        assert!("abcd".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_id_changes_with_content() {
        assert_ne!(item("a").id().unwrap(), item("b").id().unwrap());
    }

    #[test]
    fn test_transaction_collects_revoked_and_created() {
        let old = item("old");
        let old_id = old.id().unwrap();
        let child = item("child");
        let child_id = child.id().unwrap();

        let mut root = Item::revision_of(&old, b"root".to_vec()).unwrap();
        root.new_items.push(child_id);

        let tx = Transaction::new(root, vec![child]).unwrap();
        assert_eq!(tx.revoking_ids().into_iter().collect::<Vec<_>>(), vec![old_id]);
        assert_eq!(tx.new_item_ids().into_iter().collect::<Vec<_>>(), vec![child_id]);
        assert_eq!(tx.root().origin, Some(old_id));
    }

    #[test]
    fn test_missing_new_item_rejected() {
        let mut root = item("root");
        root.new_items.push(ItemId::digest(b"nowhere"));
        assert!(matches!(Transaction::single(root), Err(ItemError::Structure(_))));
    }

    #[test]
    fn test_orphan_item_rejected() {
        let root = item("root");
        let stray = item("stray");
        assert!(matches!(Transaction::new(root, vec![stray]), Err(ItemError::Structure(_))));
    }

    #[test]
    fn test_created_and_revoked_rejected() {
        let child = item("child");
        let child_id = child.id().unwrap();
        let mut root = item("root");
        root.new_items.push(child_id);
        root.revoking.push(child_id);
        assert!(Transaction::new(root, vec![child]).is_err());
    }

    #[test]
    fn test_pack_unpack_preserves_ids() {
        let child = item("child").with_environment(b"env".to_vec());
        let mut root = item("root");
        root.new_items.push(child.id().unwrap());
        let tx = Transaction::new(root, vec![child]).unwrap();

        let restored = Transaction::unpack(&tx.pack().unwrap()).unwrap();
        assert_eq!(restored, tx);
        assert_eq!(restored.root_id(), tx.root_id());
    }

    #[test]
    fn test_basic_check_flags_expired() {
        let now = Utc::now();
        let expired = Item::new(b"old".to_vec(), now - Duration::days(2), now - Duration::days(1));
        let tx = Transaction::single(expired).unwrap();
        let errors = BasicCheck.check(&tx).unwrap_err();
        assert_eq!(errors[0].code, ErrorCode::Expired);

        assert!(BasicCheck.check(&Transaction::single(item("fresh")).unwrap()).is_ok());
    }
}

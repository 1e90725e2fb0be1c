//! Durable ledger of item states
//!
//! SQLite-backed store of [`StateRecord`]s keyed by item id, plus the packed
//! copies of items this node has seen and the per-origin environment side
//! data of approved items.
//!
//! Handles:
//! - `find_or_create` of pending records
//! - revision locks (APPROVED -> LOCKED) and creation locks (LOCKED_FOR_CREATION)
//! - atomic multi-record batches for commit and resync
//! - per-id exclusive scopes via [`KeyedLocks`]

mod locks;
mod record;
mod retry;
mod state;

pub use locks::{KeyedLocks, LockScope};
pub use record::{ItemResult, StateRecord};
pub use retry::RetryPolicy;
pub use state::ItemState;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::item::ItemId;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id BLOB NOT NULL UNIQUE,
        state INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        locked_by_id INTEGER
    );
    CREATE INDEX IF NOT EXISTS ledger_locked_by ON ledger(locked_by_id);
    CREATE INDEX IF NOT EXISTS ledger_state ON ledger(state);

    CREATE TABLE IF NOT EXISTS items (
        id BLOB PRIMARY KEY,
        packed BLOB NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS environments (
        item_id BLOB PRIMARY KEY,
        origin BLOB NOT NULL UNIQUE,
        data BLOB NOT NULL
    );
";

const RECORD_COLUMNS: &str = "id, item_id, state, created_at, expires_at, locked_by_id";

/// Side data stored with an approved revision. At most one per origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub item_id: ItemId,
    pub origin: ItemId,
    pub data: Vec<u8>,
}

/// Outcome of [`Ledger::lock_for_revision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionLock {
    Acquired(StateRecord),
    /// Held by another pending revision.
    AlreadyLocked,
    /// Unknown here, or not in an approved state.
    Unavailable,
}

/// Outcome of [`Ledger::lock_for_creation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationLock {
    Acquired(StateRecord),
    Conflict,
}

/// One step of an atomic [`Ledger::apply`] batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or update the record for `item_id`; `record_id` is ignored.
    Put(StateRecord),
    Destroy(ItemId),
    PutEnvironment(Environment),
    RemoveEnvironment(ItemId),
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub retry: RetryPolicy,
    /// Lifetime of a freshly created pending record.
    pub pending_ttl: chrono::Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pending_ttl: chrono::Duration::minutes(5),
        }
    }
}

/// Truncate to whole seconds, the precision the ledger stores.
pub fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    from_secs(t.timestamp())
}

fn from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

struct RawRecord {
    id: i64,
    item_id: Vec<u8>,
    state: i64,
    created_at: i64,
    expires_at: i64,
    locked_by: Option<i64>,
}

impl RawRecord {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: row.get(1)?,
            state: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
            locked_by: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<StateRecord, LedgerError> {
        let item_id = ItemId::from_bytes(&self.item_id).map_err(|e| LedgerError::Corrupt(e.to_string()))?;
        let state = ItemState::from_ordinal(self.state)
            .ok_or_else(|| LedgerError::Corrupt(format!("state ordinal {} for {}", self.state, item_id)))?;
        Ok(StateRecord {
            record_id: self.id,
            item_id,
            state,
            created_at: from_secs(self.created_at),
            expires_at: from_secs(self.expires_at),
            locked_by_record_id: self.locked_by,
        })
    }
}

pub struct Ledger {
    conn: Mutex<Connection>,
    locks: KeyedLocks,
    options: LedgerOptions,
}

impl Ledger {
    /// Open or create the ledger database at `path`.
    pub fn open(path: &Path, options: LedgerOptions) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=1000;")?;
        let ledger = Self::with_connection(conn, options)?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory(options: LedgerOptions) -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: LedgerOptions) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: KeyedLocks::new(),
            options,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.options.retry
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        self.options.pending_ttl
    }

    /// Exclusive scope over `ids`; every mutation of an id happens inside one.
    pub async fn scope(&self, ids: impl IntoIterator<Item = ItemId>) -> LockScope {
        self.locks.acquire(ids).await
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn get_record(&self, item_id: &ItemId) -> Result<Option<StateRecord>, LedgerError> {
        let conn = self.conn()?;
        Self::select_by_item(&conn, item_id)
    }

    pub fn get_record_by_id(&self, record_id: i64) -> Result<Option<StateRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!("SELECT {} FROM ledger WHERE id = ?1", RECORD_COLUMNS))?;
        stmt.query_row([record_id], RawRecord::read)
            .optional()?
            .map(RawRecord::into_record)
            .transpose()
    }

    fn select_by_item(conn: &Connection, item_id: &ItemId) -> Result<Option<StateRecord>, LedgerError> {
        let mut stmt = conn.prepare_cached(&format!("SELECT {} FROM ledger WHERE item_id = ?1", RECORD_COLUMNS))?;
        stmt.query_row([item_id.as_bytes()], RawRecord::read)
            .optional()?
            .map(RawRecord::into_record)
            .transpose()
    }

    fn insert(
        conn: &Connection,
        item_id: &ItemId,
        state: ItemState,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        locked_by: Option<i64>,
    ) -> Result<StateRecord, LedgerError> {
        conn.prepare_cached(
            "INSERT INTO ledger (item_id, state, created_at, expires_at, locked_by_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            item_id.as_bytes(),
            state.ordinal(),
            created_at.timestamp(),
            expires_at.timestamp(),
            locked_by
        ])?;
        Ok(StateRecord {
            record_id: conn.last_insert_rowid(),
            item_id: *item_id,
            state,
            created_at: whole_seconds(created_at),
            expires_at: whole_seconds(expires_at),
            locked_by_record_id: locked_by,
        })
    }

    /// Existing record for `item_id`, or a new PENDING one with the default TTL.
    pub fn find_or_create(&self, item_id: &ItemId) -> Result<StateRecord, LedgerError> {
        let conn = self.conn()?;
        if let Some(record) = Self::select_by_item(&conn, item_id)? {
            return Ok(record);
        }
        let now = Utc::now();
        let record = Self::insert(&conn, item_id, ItemState::Pending, now, now + self.options.pending_ttl, None)?;
        debug!(item = %item_id.short(), record = record.record_id, "Created pending record");
        Ok(record)
    }

    /// Create a record in an explicit state. Fails if one already exists.
    pub fn create(
        &self,
        item_id: &ItemId,
        state: ItemState,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<StateRecord, LedgerError> {
        let conn = self.conn()?;
        Self::insert(&conn, item_id, state, created_at, expires_at, None)
    }

    /// Persist state, timestamps and lock holder of an existing record.
    pub fn save(&self, record: &StateRecord) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let current = Self::select_by_item(&conn, &record.item_id)?;
        if let Some(current) = &current {
            if !current.state.can_transition_to(record.state) {
                return Err(LedgerError::IllegalTransition {
                    item: record.item_id,
                    from: current.state,
                    to: record.state,
                });
            }
        }
        let updated = conn
            .prepare_cached(
                "UPDATE ledger SET state = ?2, created_at = ?3, expires_at = ?4, locked_by_id = ?5
                 WHERE id = ?1",
            )?
            .execute(params![
                record.record_id,
                record.state.ordinal(),
                record.created_at.timestamp(),
                record.expires_at.timestamp(),
                record.locked_by_record_id
            ])?;
        if updated == 0 {
            return Err(LedgerError::Corrupt(format!("no record {} to save", record.record_id)));
        }
        Ok(())
    }

    /// Remove a non-final record.
    pub fn destroy(&self, record: &StateRecord) -> Result<(), LedgerError> {
        if record.state.is_terminal() {
            return Err(LedgerError::FinalRecord(record.item_id));
        }
        let conn = self.conn()?;
        conn.prepare_cached("DELETE FROM ledger WHERE id = ?1")?
            .execute([record.record_id])?;
        Ok(())
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Move an APPROVED record to LOCKED on behalf of `locker`.
    /// Re-locking by the same holder succeeds.
    pub fn lock_for_revision(&self, item_id: &ItemId, locker: &StateRecord) -> Result<RevisionLock, LedgerError> {
        let conn = self.conn()?;
        let Some(mut record) = Self::select_by_item(&conn, item_id)? else {
            return Ok(RevisionLock::Unavailable);
        };
        match record.state {
            ItemState::Approved => {
                conn.prepare_cached("UPDATE ledger SET state = ?2, locked_by_id = ?3 WHERE id = ?1")?
                    .execute(params![record.record_id, ItemState::Locked.ordinal(), locker.record_id])?;
                record.state = ItemState::Locked;
                record.locked_by_record_id = Some(locker.record_id);
                Ok(RevisionLock::Acquired(record))
            }
            ItemState::Locked if record.locked_by_record_id == Some(locker.record_id) => {
                Ok(RevisionLock::Acquired(record))
            }
            ItemState::Locked => Ok(RevisionLock::AlreadyLocked),
            _ => Ok(RevisionLock::Unavailable),
        }
    }

    /// Reserve a not-yet-existing id for `locker` as LOCKED_FOR_CREATION.
    pub fn lock_for_creation(&self, item_id: &ItemId, locker: &StateRecord) -> Result<CreationLock, LedgerError> {
        let conn = self.conn()?;
        match Self::select_by_item(&conn, item_id)? {
            None => {
                let record = Self::insert(
                    &conn,
                    item_id,
                    ItemState::LockedForCreation,
                    Utc::now(),
                    locker.expires_at,
                    Some(locker.record_id),
                )?;
                Ok(CreationLock::Acquired(record))
            }
            Some(record)
                if record.state == ItemState::LockedForCreation
                    && record.locked_by_record_id == Some(locker.record_id) =>
            {
                Ok(CreationLock::Acquired(record))
            }
            Some(_) => Ok(CreationLock::Conflict),
        }
    }

    pub fn records_locked_by(&self, record_id: i64) -> Result<Vec<StateRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM ledger WHERE locked_by_id = ?1 ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([record_id], RawRecord::read)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    /// Records left in a voting state, e.g. by a crash.
    pub fn find_unfinished(&self) -> Result<Vec<StateRecord>, LedgerError> {
        self.select_states(&[ItemState::Pending, ItemState::PendingPositive, ItemState::PendingNegative])
    }

    /// Records held by a revision lock or a creation lock.
    pub fn find_locked(&self) -> Result<Vec<StateRecord>, LedgerError> {
        self.select_states(&[ItemState::Locked, ItemState::LockedForCreation])
    }

    fn select_states(&self, states: &[ItemState]) -> Result<Vec<StateRecord>, LedgerError> {
        let conn = self.conn()?;
        let placeholders = vec!["?"; states.len()].join(", ");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM ledger WHERE state IN ({}) ORDER BY id",
            RECORD_COLUMNS, placeholders
        ))?;
        let ordinals: Vec<i64> = states.iter().map(|s| s.ordinal()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(ordinals), RawRecord::read)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Apply `ops` in one transaction. Any illegal transition aborts the whole batch.
    pub fn apply(&self, ops: &[BatchOp]) -> Result<(), LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                BatchOp::Put(record) => {
                    if let Some(current) = Self::select_by_item(&tx, &record.item_id)? {
                        if !current.state.can_transition_to(record.state) {
                            return Err(LedgerError::IllegalTransition {
                                item: record.item_id,
                                from: current.state,
                                to: record.state,
                            });
                        }
                    }
                    tx.prepare_cached(
                        "INSERT INTO ledger (item_id, state, created_at, expires_at, locked_by_id)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(item_id) DO UPDATE SET
                            state = excluded.state,
                            created_at = excluded.created_at,
                            expires_at = excluded.expires_at,
                            locked_by_id = excluded.locked_by_id",
                    )?
                    .execute(params![
                        record.item_id.as_bytes(),
                        record.state.ordinal(),
                        record.created_at.timestamp(),
                        record.expires_at.timestamp(),
                        record.locked_by_record_id
                    ])?;
                }
                BatchOp::Destroy(item_id) => {
                    tx.prepare_cached("DELETE FROM ledger WHERE item_id = ?1")?
                        .execute([item_id.as_bytes()])?;
                }
                BatchOp::PutEnvironment(env) => Self::upsert_environment(&tx, env)?,
                BatchOp::RemoveEnvironment(item_id) => {
                    tx.prepare_cached("DELETE FROM environments WHERE item_id = ?1")?
                        .execute([item_id.as_bytes()])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Item copies
    // =========================================================================

    pub fn put_item(&self, id: &ItemId, packed: &[u8], expires_at: DateTime<Utc>) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO items (id, packed, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET expires_at = MAX(expires_at, excluded.expires_at)",
        )?
        .execute(params![id.as_bytes(), packed, expires_at.timestamp()])?;
        Ok(())
    }

    pub fn get_item(&self, id: &ItemId) -> Result<Option<Vec<u8>>, LedgerError> {
        let conn = self.conn()?;
        let packed = conn
            .prepare_cached("SELECT packed FROM items WHERE id = ?1")?
            .query_row([id.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(packed)
    }

    pub fn has_item(&self, id: &ItemId) -> Result<bool, LedgerError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .prepare_cached("SELECT 1 FROM items WHERE id = ?1")?
            .query_row([id.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Drop stored copies that expired before `now`.
    pub fn purge_expired_items(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let conn = self.conn()?;
        let removed = conn
            .prepare_cached("DELETE FROM items WHERE expires_at < ?1")?
            .execute([now.timestamp()])?;
        Ok(removed)
    }

    // =========================================================================
    // Environments
    // =========================================================================

    fn upsert_environment(conn: &Connection, env: &Environment) -> Result<(), LedgerError> {
        conn.prepare_cached("DELETE FROM environments WHERE origin = ?1 AND item_id != ?2")?
            .execute(params![env.origin.as_bytes(), env.item_id.as_bytes()])?;
        conn.prepare_cached(
            "INSERT INTO environments (item_id, origin, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(item_id) DO UPDATE SET origin = excluded.origin, data = excluded.data",
        )?
        .execute(params![env.item_id.as_bytes(), env.origin.as_bytes(), env.data])?;
        Ok(())
    }

    /// Store side data, replacing any older revision's data for the same origin.
    pub fn save_environment(&self, env: &Environment) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        Self::upsert_environment(&conn, env)
    }

    pub fn get_environment(&self, item_id: &ItemId) -> Result<Option<Environment>, LedgerError> {
        self.query_environment("SELECT item_id, origin, data FROM environments WHERE item_id = ?1", item_id)
    }

    pub fn environment_for_origin(&self, origin: &ItemId) -> Result<Option<Environment>, LedgerError> {
        self.query_environment("SELECT item_id, origin, data FROM environments WHERE origin = ?1", origin)
    }

    fn query_environment(&self, sql: &str, key: &ItemId) -> Result<Option<Environment>, LedgerError> {
        let conn = self.conn()?;
        let raw: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> = conn
            .prepare_cached(sql)?
            .query_row([key.as_bytes()], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;
        raw.map(|(item_id, origin, data)| {
            Ok(Environment {
                item_id: ItemId::from_bytes(&item_id).map_err(|e| LedgerError::Corrupt(e.to_string()))?,
                origin: ItemId::from_bytes(&origin).map_err(|e| LedgerError::Corrupt(e.to_string()))?,
                data,
            })
        })
        .transpose()
    }

    pub fn remove_environment(&self, item_id: &ItemId) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.prepare_cached("DELETE FROM environments WHERE item_id = ?1")?
            .execute([item_id.as_bytes()])?;
        Ok(())
    }

    // =========================================================================
    // Projection
    // =========================================================================

    /// Client view of `item_id`; UNDEFINED when no record exists.
    pub fn item_result(&self, item_id: &ItemId) -> Result<ItemResult, LedgerError> {
        let Some(record) = self.get_record(item_id)? else {
            return Ok(ItemResult::undefined());
        };
        let mut result = ItemResult::from_record(&record, self.has_item(item_id)?);
        if let Some(holder) = record.locked_by_record_id {
            result.locked_by_id = self.get_record_by_id(holder)?.map(|r| r.item_id);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerOptions::default()).unwrap()
    }

    fn id(name: &str) -> ItemId {
        ItemId::digest(name.as_bytes())
    }

    fn approved(ledger: &Ledger, name: &str) -> StateRecord {
        let now = Utc::now();
        ledger.create(&id(name), ItemState::Approved, now, now + Duration::days(1)).unwrap()
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let ledger = ledger();
        let first = ledger.find_or_create(&id("a")).unwrap();
        assert_eq!(first.state, ItemState::Pending);
        let second = ledger.find_or_create(&id("a")).unwrap();
        assert_eq!(first.record_id, second.record_id);
        assert!(first.expires_at > first.created_at);
    }

    #[test]
    fn test_save_and_reload() {
        let ledger = ledger();
        let mut record = ledger.find_or_create(&id("a")).unwrap();
        record.state = ItemState::PendingPositive;
        ledger.save(&record).unwrap();
        let loaded = ledger.get_record(&id("a")).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(ledger.get_record_by_id(record.record_id).unwrap(), Some(record));
    }

    #[test]
    fn test_save_rejects_illegal_transition() {
        let ledger = ledger();
        let mut record = approved(&ledger, "a");
        record.state = ItemState::Declined;
        assert!(matches!(ledger.save(&record), Err(LedgerError::IllegalTransition { .. })));
    }

    #[test]
    fn test_destroy_refuses_final_records() {
        let ledger = ledger();
        let record = approved(&ledger, "a");
        assert!(matches!(ledger.destroy(&record), Err(LedgerError::FinalRecord(_))));

        let pending = ledger.find_or_create(&id("b")).unwrap();
        ledger.destroy(&pending).unwrap();
        assert!(ledger.get_record(&id("b")).unwrap().is_none());
    }

    #[test]
    fn test_revision_lock_is_exclusive() {
        let ledger = ledger();
        approved(&ledger, "origin");
        let first = ledger.find_or_create(&id("rev1")).unwrap();
        let second = ledger.find_or_create(&id("rev2")).unwrap();

        let lock = ledger.lock_for_revision(&id("origin"), &first).unwrap();
        let RevisionLock::Acquired(locked) = lock else {
            panic!("expected lock, got {:?}", lock);
        };
        assert_eq!(locked.state, ItemState::Locked);
        assert_eq!(locked.locked_by_record_id, Some(first.record_id));

        assert_eq!(ledger.lock_for_revision(&id("origin"), &second).unwrap(), RevisionLock::AlreadyLocked);
        assert!(matches!(
            ledger.lock_for_revision(&id("origin"), &first).unwrap(),
            RevisionLock::Acquired(_)
        ));
        assert_eq!(ledger.lock_for_revision(&id("missing"), &first).unwrap(), RevisionLock::Unavailable);
    }

    #[test]
    fn test_creation_lock_conflicts() {
        let ledger = ledger();
        let first = ledger.find_or_create(&id("parent1")).unwrap();
        let second = ledger.find_or_create(&id("parent2")).unwrap();

        let CreationLock::Acquired(record) = ledger.lock_for_creation(&id("child"), &first).unwrap() else {
            panic!("expected creation lock");
        };
        assert_eq!(record.state, ItemState::LockedForCreation);
        assert!(record.lock_is_consistent());
        assert_eq!(ledger.lock_for_creation(&id("child"), &second).unwrap(), CreationLock::Conflict);

        let locked = ledger.records_locked_by(first.record_id).unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].item_id, id("child"));
    }

    #[test]
    fn test_apply_is_atomic() {
        let ledger = ledger();
        let origin = approved(&ledger, "origin");
        let pending = ledger.find_or_create(&id("rev")).unwrap();

        let mut revoked = origin.clone();
        revoked.state = ItemState::Revoked;
        let mut bad = pending.clone();
        bad.state = ItemState::Declined;
        let mut worse = bad.clone();
        worse.state = ItemState::Approved;

        // second put of the same record is illegal: DECLINED -> APPROVED
        let result = ledger.apply(&[BatchOp::Put(revoked), BatchOp::Put(bad), BatchOp::Put(worse)]);
        assert!(result.is_err());
        assert_eq!(ledger.get_record(&id("origin")).unwrap().unwrap().state, ItemState::Approved);
        assert_eq!(ledger.get_record(&id("rev")).unwrap().unwrap().state, ItemState::Pending);
    }

    #[test]
    fn test_unfinished_records() {
        let ledger = ledger();
        approved(&ledger, "done");
        let mut voting = ledger.find_or_create(&id("voting")).unwrap();
        voting.state = ItemState::PendingNegative;
        ledger.save(&voting).unwrap();
        ledger.find_or_create(&id("fresh")).unwrap();

        let unfinished: Vec<_> = ledger.find_unfinished().unwrap().into_iter().map(|r| r.item_id).collect();
        assert_eq!(unfinished, vec![id("voting"), id("fresh")]);

        ledger.lock_for_creation(&id("child"), &voting).unwrap();
        let locked = ledger.find_locked().unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].state, ItemState::LockedForCreation);
    }

    #[test]
    fn test_environment_unique_per_origin() {
        let ledger = ledger();
        let origin = id("origin");
        ledger
            .save_environment(&Environment { item_id: id("rev1"), origin, data: b"one".to_vec() })
            .unwrap();
        ledger
            .save_environment(&Environment { item_id: id("rev2"), origin, data: b"two".to_vec() })
            .unwrap();

        assert!(ledger.get_environment(&id("rev1")).unwrap().is_none());
        let current = ledger.environment_for_origin(&origin).unwrap().unwrap();
        assert_eq!(current.item_id, id("rev2"));
        assert_eq!(current.data, b"two");

        ledger.remove_environment(&id("rev2")).unwrap();
        assert!(ledger.environment_for_origin(&origin).unwrap().is_none());
    }

    #[test]
    fn test_item_copies_and_purge() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.put_item(&id("old"), b"old", now - Duration::hours(1)).unwrap();
        ledger.put_item(&id("new"), b"new", now + Duration::hours(1)).unwrap();
        assert_eq!(ledger.get_item(&id("new")).unwrap(), Some(b"new".to_vec()));

        assert_eq!(ledger.purge_expired_items(now).unwrap(), 1);
        assert!(!ledger.has_item(&id("old")).unwrap());
        assert!(ledger.has_item(&id("new")).unwrap());
    }

    #[test]
    fn test_item_result_reports_lock_holder() {
        let ledger = ledger();
        approved(&ledger, "origin");
        let rev = ledger.find_or_create(&id("rev")).unwrap();
        ledger.lock_for_revision(&id("origin"), &rev).unwrap();

        let result = ledger.item_result(&id("origin")).unwrap();
        assert_eq!(result.state, ItemState::Locked);
        assert_eq!(result.locked_by_id, Some(id("rev")));
        assert!(!result.have_copy);

        assert_eq!(ledger.item_result(&id("unknown")).unwrap().state, ItemState::Undefined);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
            approved(&ledger, "kept");
        }
        let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
        assert_eq!(ledger.get_record(&id("kept")).unwrap().unwrap().state, ItemState::Approved);
    }
}

//! Per-item exclusive scopes
//!
//! Mutations of one item id are serialized; different ids proceed in
//! parallel. Multi-id scopes acquire in sorted order so two scopes over
//! overlapping sets cannot deadlock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::item::ItemId;

type Slot = Arc<Mutex<()>>;

#[derive(Default)]
pub struct KeyedLocks {
    slots: Arc<DashMap<ItemId, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every id in `ids` until the returned scope is dropped.
    pub async fn acquire(&self, ids: impl IntoIterator<Item = ItemId>) -> LockScope {
        let mut ids: Vec<ItemId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let slot = self.slots.entry(*id).or_default().clone();
            guards.push(slot.lock_owned().await);
        }

        LockScope {
            ids,
            guards,
            slots: self.slots.clone(),
        }
    }

    /// Number of ids with a live slot.
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

pub struct LockScope {
    ids: Vec<ItemId>,
    guards: Vec<OwnedMutexGuard<()>>,
    slots: Arc<DashMap<ItemId, Slot>>,
}

impl LockScope {
    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    pub fn covers(&self, id: &ItemId) -> bool {
        self.ids.binary_search(id).is_ok()
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        self.guards.clear();
        for id in &self.ids {
            // clones are only taken under the shard lock, so a count of one
            // means nobody is waiting on this slot
            self.slots.remove_if(id, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let id = ItemId::digest(b"a");

        let scope = locks.acquire([id]).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _scope = locks.acquire([id]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        drop(scope);
        tokio::time::timeout(Duration::from_secs(1), contender).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire([ItemId::digest(b"a")]).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire([ItemId::digest(b"b")])).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_slots_are_released() {
        let locks = KeyedLocks::new();
        let ids = [ItemId::digest(b"x"), ItemId::digest(b"y"), ItemId::digest(b"x")];
        let scope = locks.acquire(ids).await;
        assert_eq!(scope.ids().len(), 2);
        assert!(scope.covers(&ItemId::digest(b"y")));
        assert_eq!(locks.active(), 2);
        drop(scope);
        assert_eq!(locks.active(), 0);
    }
}

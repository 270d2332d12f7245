//! crates/study_state_core/src/cache.rs
//!
//! Per-key cache slots and the cache-miss reconciliation helper shared by the managers.
//!
//! Every key owns one slot: an async mutex guarding `Option<V>`. Holding the slot's guard
//! is what serializes read-modify-write sequences for that key, so two tasks touching the
//! same owner (or appending to the same lecture) run one after the other while different
//! keys never contend beyond the map's shard lock.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ports::PortResult;

type Slot<V> = Arc<Mutex<Option<V>>>;

/// A sharded map of key -> (state, lock).
pub struct KeyedSlots<K, V> {
    slots: DashMap<K, Slot<V>>,
}

impl<K, V> Default for KeyedSlots<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedSlots<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Locks the slot for `key`, creating an empty one if needed.
    ///
    /// The shard lock is released before awaiting the slot's mutex.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<Option<V>> {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        slot.lock_owned().await
    }

    /// Locks the slot for `key` only if one exists. Never creates a slot.
    pub async fn lock_existing(&self, key: &K) -> Option<OwnedMutexGuard<Option<V>>> {
        let slot = self.slots.get(key).map(|entry| entry.value().clone())?;
        Some(slot.lock_owned().await)
    }

    /// Clones the cached value for `key`, waiting for any in-flight mutation to finish.
    pub async fn snapshot(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.lock_existing(key).await.and_then(|guard| guard.clone())
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of slots currently holding a value. Slots being mutated are skipped.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|guard| guard.is_some())
                    .unwrap_or(true)
            })
            .count()
    }

    /// Drops slots that are empty and referenced by nobody but the map.
    ///
    /// `remove_if` holds the shard's write lock, so no other task can clone the slot
    /// between the reference-count check and the removal.
    pub fn prune(&self) -> usize {
        let mut removed = 0;
        for key in self.keys() {
            let dropped = self.slots.remove_if(&key, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_lock().map(|guard| guard.is_none()).unwrap_or(false)
            });
            if dropped.is_some() {
                removed += 1;
            }
        }
        removed
    }
}

//=========================================================================================
// Reconciliation Loader
//=========================================================================================

/// How a slot came to hold (or not hold) a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The value was already cached; no durable read happened.
    Cached,
    /// The cache missed and the durable store supplied the value.
    Loaded,
    /// The cache missed and the durable store has nothing for this key.
    Absent,
}

/// Fills an empty slot from the durable store.
///
/// On a cache hit nothing is read. On a miss exactly one durable read is issued; a found
/// value populates the slot. "Not found" is a legitimate outcome (`Reconciled::Absent`),
/// while a failing read is propagated untouched. There is no retry.
pub async fn reconcile<V, F, Fut>(slot: &mut Option<V>, load: F) -> PortResult<Reconciled>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PortResult<Option<V>>>,
{
    if slot.is_some() {
        return Ok(Reconciled::Cached);
    }
    match load().await? {
        Some(value) => {
            *slot = Some(value);
            Ok(Reconciled::Loaded)
        }
        None => Ok(Reconciled::Absent),
    }
}

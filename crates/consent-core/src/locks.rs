//! Per-key async mutual exclusion.
//!
//! Grant mutation is serialized per (patient, doctor) pair, token redemption
//! per token id and emergency transitions per session id. Unrelated keys
//! never contend.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

pub struct KeyedLocks<K: Eq + Hash> {
    slots: DashMap<K, Slot>,
}

/// Exclusive hold on one key. Dropping the last guard or waiter for a key
/// removes its slot, so the registry only holds keys in use.
pub struct KeyGuard<'a, K: Eq + Hash> {
    key: K,
    slots: &'a DashMap<K, Slot>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // Release the mutex first so its Arc no longer counts
        self.guard.take();
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &K) -> KeyGuard<'_, K> {
        // Clone the slot out so the shard lock is not held across the await
        let slot = {
            let entry = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        KeyGuard {
            key: key.clone(),
            slots: &self.slots,
            guard: Some(slot.lock_owned().await),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

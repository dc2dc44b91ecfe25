use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
///
/// Work on different keys proceeds in parallel; work on the same key is
/// serialized. Each slot also holds a value of type `V` that survives
/// between lock holders, unless the map was built with [`KeyedLocks::evicting`].
pub struct KeyedLocks<K, V = ()> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
    evict_idle: bool,
}

impl<K, V> KeyedLocks<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            evict_idle: false,
        }
    }

    /// Like [`KeyedLocks::new`], but slots nobody holds or waits on are
    /// dropped, so the map stays bounded by the number of keys in flight.
    /// Slot values do not survive eviction.
    pub fn evicting() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            evict_idle: true,
        }
    }

    /// Wait for exclusive access to `key`'s slot.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.evict_idle {
                // Slots are only cloned under this lock, so a count of one
                // means no guard or waiter exists.
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(key.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl<K, V> Default for KeyedLocks<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

//! Keyed async lock
//!
//! Serializes work on the same key (a block or transaction hash) while
//! unrelated keys proceed in parallel. Entries are dropped from the table
//! once the last holder or waiter releases them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
pub struct Locker<K: Eq + Hash + Clone> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
}

impl<K: Eq + Hash + Clone> Default for Locker<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> Locker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> LockGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };

        let guard = slot.lock_owned().await;

        LockGuard {
            key,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Someone is holding or waiting on `key`
    pub fn has(&self, key: &K) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.contains_key(key)
    }
}

/// Releases the key on drop
pub struct LockGuard<K: Eq + Hash + Clone> {
    key: K,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for LockGuard<K> {
    fn drop(&mut self) {
        // Release first so the strong count reflects waiters only.
        self.guard.take();

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locker = Arc::new(Locker::<u32>::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locker.lock(1).await;
        assert!(locker.has(&1));

        let task = {
            let locker = locker.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = locker.lock(1).await;
                order.lock().unwrap().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().unwrap().push("first");
        drop(first);

        task.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(!locker.has(&1));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locker = Locker::<u32>::new();
        let _a = locker.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locker.lock(2))
            .await
            .unwrap();
        assert!(locker.has(&1));
        assert!(locker.has(&2));
    }
}

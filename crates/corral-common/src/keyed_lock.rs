//! Per-key async mutex
//!
//! Holders of the same key serialize; different keys never contend beyond
//! the map shard. Used to guarantee at most one builder per cluster.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of named async mutexes
///
/// Entries are created on first use and live until [`KeyedLock::remove`]
/// or [`KeyedLock::retain_held`] drops them.
#[derive(Default)]
pub struct KeyedLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLock {
    /// Create an empty keyed lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for `key`, waiting for any current holder
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Forget `key` unless a task holds or awaits its mutex
    pub fn remove(&self, key: &str) -> bool {
        // The map owns one reference; any other is a holder or waiter.
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
    }

    /// Forget every key nobody holds or awaits
    pub fn retain_held(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

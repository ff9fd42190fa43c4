//! Keyed async mutual exclusion.
//!
//! One FIFO queue per key: holders of the same key never overlap, while
//! different keys run concurrently. Entries are dropped once nobody holds or
//! waits on them, so the table does not grow with the number of projects ever
//! seen.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct LockManager {
    locks: Mutex<HashMap<String, KeyLock>>,
    warn_after: Duration,
}

impl LockManager {
    /// `warn_after` is the wait time above which contention is logged at
    /// `warn` instead of `debug`.
    pub fn new(warn_after: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            warn_after,
        }
    }

    /// Run `f` once every earlier caller for `key` has finished.
    ///
    /// Waiters are served in arrival order. The lock is released when `f`
    /// completes, fails, panics or is cancelled, and whatever `f` returns is
    /// handed back to the caller unchanged.
    pub async fn acquire<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.entry(key);
        let slot = Slot {
            manager: self,
            key,
            lock: Some(lock.clone()),
        };

        let started = Instant::now();
        let guard = lock.lock_owned().await;
        let waited = started.elapsed();
        if waited >= self.warn_after {
            warn!(key, waited_ms = waited.as_millis() as u64, "long wait for project lock");
        } else if !waited.is_zero() {
            debug!(key, waited_ms = waited.as_millis() as u64, "project lock contended");
        }

        let out = f().await;
        drop(guard);
        drop(slot);
        out
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.table().len()
    }

    fn entry(&self, key: &str) -> KeyLock {
        self.table()
            .entry(key.to_string())
            .or_insert_with(KeyLock::default)
            .clone()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeyLock>> {
        self.locks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Holds one reference to a key's lock; dropping it prunes the table entry
/// when no other holder or waiter remains.
struct Slot<'a> {
    manager: &'a LockManager,
    key: &'a str,
    lock: Option<KeyLock>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut table = self.manager.table();
        drop(self.lock.take());
        if table
            .get(self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            table.remove(self.key);
        }
    }
}

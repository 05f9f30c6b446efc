//! Per-key mutual exclusion with a self-cleaning registry
//!
//! Requests with the same coalescing key serialize on one async mutex; requests
//! with different keys never wait on each other. Each registry entry counts the
//! callers holding or waiting for it and is removed as soon as that count drops
//! to zero, so the registry never grows with the number of distinct keys seen.

use std::collections::HashMap;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<String, Entry>>>;

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

/// Registry of per-key locks
#[derive(Clone, Default)]
pub struct KeyLocker {
    entries: Registry,
}

impl KeyLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting for any current holder
    ///
    /// The lock is released when the returned guard is unlocked or dropped.
    /// Dropping this future while it waits withdraws the caller from the entry.
    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        let key = key.into();

        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };

        let mut waiting = Waiting {
            entries: self.entries.clone(),
            key: Some(key),
        };
        let guard = lock.lock_owned().await;

        KeyGuard {
            entries: self.entries.clone(),
            key: waiting.key.take().unwrap_or_default(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Holders and waiters registered for `key`
    pub fn holders(&self, key: &str) -> usize {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.holders)
            .unwrap_or(0)
    }
}

/// Decrements the holder count of `key`, removing the entry at zero
///
/// Panics when the entry is missing: that means lock and unlock calls are no
/// longer paired and the registry can't be trusted.
fn release(entries: &Registry, key: &str) {
    let mut entries = entries.lock();
    let Some(entry) = entries.get_mut(key) else {
        drop(entries);
        if std::thread::panicking() {
            error!("Unlock requested for key={} but no entry found", key);
            return;
        }
        panic!("Unlock requested for key={} but no entry found", key);
    };

    entry.holders -= 1;
    if entry.holders == 0 {
        entries.remove(key);
    }
}

/// Withdraws a caller whose `lock` future was dropped before acquiring
struct Waiting {
    entries: Registry,
    key: Option<String>,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release(&self.entries, &key);
        }
    }
}

/// Held lock for one key
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard {
    entries: Registry,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock and lets the next waiter for this key through
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Registry bookkeeping first, then the mutex itself.
        release(&self.entries, &self.key);
        self.guard.take();
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

//! Keyed mutual exclusion with bounded waits.
//!
//! The table's own mutex is held only to check and flip a key's "held"
//! bit; it is never held while the caller's critical section runs, so
//! distinct keys never wait on each other.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timed out after {0:?} waiting for lock")]
pub struct LockTimeout(pub Duration);

#[derive(Debug)]
pub struct KeyedLocks<K> {
    held: Mutex<HashSet<K>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free or `timeout` elapses.
    ///
    /// The returned guard releases the key when dropped, on every exit path.
    pub fn acquire(&self, key: K, timeout: Duration) -> Result<KeyGuard<'_, K>, LockTimeout> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockTimeout(timeout));
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
        held.insert(key.clone());
        Ok(KeyGuard { locks: self, key })
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    locks: &'a KeyedLocks<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.locks.released.notify_all();
    }
}

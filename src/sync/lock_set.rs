//! Keyed lock set
//!
//! Grants one mutual-exclusion lock per arbitrary key (install location,
//! module name), with blocking and bounded-wait acquisition. Entries are
//! created lazily on first use and never removed; the key space is assumed
//! bounded (install locations and module names).

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Default)]
struct KeyLockState {
    owner: Option<ThreadId>,
    holds: usize,
}

#[derive(Default)]
struct KeyLock {
    state: Mutex<KeyLockState>,
    cond: Condvar,
}

/// A set of mutual-exclusion locks keyed by arbitrary values.
///
/// Reentrancy is configured per instance. In non-reentrant mode a second
/// acquisition attempt by the thread that already holds a key fails fast
/// (returns `None`) instead of deadlocking. In reentrant mode nested
/// acquisition succeeds and the key is released when the last guard drops.
pub struct LockSet<K> {
    locks: Mutex<HashMap<K, Arc<KeyLock>>>,
    reentrant: bool,
}

impl<K: Eq + Hash + Clone> LockSet<K> {
    /// Create a new lock set
    pub fn new(reentrant: bool) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            reentrant,
        }
    }

    /// Look up or lazily create the lock entry for a key.
    ///
    /// The global map guard is held only for the lookup; waiting always
    /// happens on the entry itself so independent keys never contend.
    fn entry(&self, key: &K) -> Arc<KeyLock> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Acquire the lock for `key`, blocking until it is available.
    ///
    /// Returns `None` only when the calling thread already holds the key and
    /// this set is non-reentrant.
    pub fn lock(&self, key: K) -> Option<KeyGuard<K>> {
        self.acquire(key, None)
    }

    /// Try to acquire the lock for `key` without blocking
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<K>> {
        self.acquire(key, Some(Duration::ZERO))
    }

    /// Try to acquire the lock for `key`, waiting at most `timeout`
    pub fn try_lock_for(&self, key: K, timeout: Duration) -> Option<KeyGuard<K>> {
        self.acquire(key, Some(timeout))
    }

    fn acquire(&self, key: K, timeout: Option<Duration>) -> Option<KeyGuard<K>> {
        let me = thread::current().id();
        let entry = self.entry(&key);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = entry.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.holds = 1;
                    drop(state);
                    return Some(KeyGuard { lock: entry, key, _not_send: std::marker::PhantomData });
                }
                Some(owner) if owner == me => {
                    if !self.reentrant {
                        return None;
                    }
                    state.holds += 1;
                    drop(state);
                    return Some(KeyGuard { lock: entry, key, _not_send: std::marker::PhantomData });
                }
                Some(_) => match deadline {
                    None => {
                        entry.cond.wait(&mut state);
                    }
                    Some(deadline) => {
                        if entry.cond.wait_until(&mut state, deadline).timed_out() {
                            return None;
                        }
                    }
                },
            }
        }
    }
}

impl<K> std::fmt::Debug for LockSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet")
            .field("reentrant", &self.reentrant)
            .finish_non_exhaustive()
    }
}

/// Guard for one hold on one key; releases the hold when dropped.
///
/// Not `Send`: a hold belongs to the thread that acquired it.
pub struct KeyGuard<K> {
    lock: Arc<KeyLock>,
    key: K,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<K> KeyGuard<K> {
    /// The key this guard holds
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            drop(state);
            self.lock.cond.notify_one();
        }
    }
}

//! Upgradeable read/write lock
//!
//! A reader/writer lock with a single upgrade-reservation slot. Many readers
//! may hold the lock concurrently; exactly one writer may hold it exclusively;
//! a reader that declared upfront an intent to upgrade may later perform that
//! upgrade without deadlocking against other upgrade attempts.
//!
//! A naive "read lock then write lock" sequence deadlocks when two readers try
//! to upgrade simultaneously. The single reservation slot totally orders
//! upgrade attempts: at most one thread is ever mid-upgrade, and every other
//! thread either holds plain reads (compatible with a pending upgrader) or
//! waits for the reservation to clear before trying to write.
//!
//! This is a hand-rolled state machine (reader counts, writer identity,
//! reservation identity, condition variables) rather than a composition of
//! off-the-shelf RW locks: the upgrade-without-deadlock contract is not
//! expressible by composing a standard reader/writer lock alone.
//!
//! Fairness: once a writer is waiting, new read acquisitions queue behind it;
//! reentrant read holds are exempt so a reader cannot deadlock itself against
//! a pending writer. Strict FIFO across reader cohorts is not promised.
//!
//! Contract violations (re-reserving, re-entrant write acquisition, taking the
//! write lock while holding plain reads) are programming errors and panic;
//! they must not be caught and retried.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct LockState {
    /// Read holds per thread; supports reentrant reads and the hold-count
    /// diagnostic
    read_holds: HashMap<ThreadId, usize>,
    /// Sum of all read holds
    total_reads: usize,
    /// Thread currently holding the exclusive lock
    writer: Option<ThreadId>,
    /// Thread currently holding the upgrade reservation. Holding the
    /// reservation does not by itself grant write access; it is strictly a
    /// ticket to later upgrade without contention from other upgraders.
    reservation: Option<ThreadId>,
    /// Number of threads waiting for the exclusive lock
    writer_waiting: usize,
}

/// A read/write lock over `T` supporting read-to-write upgrade.
///
/// See the module documentation for the locking protocol.
pub struct UpgradeableRwLock<T> {
    state: Mutex<LockState>,
    /// Waiters for read availability and for the reservation slot
    readers: Condvar,
    /// Waiters for the exclusive lock
    writers: Condvar,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is mediated by the lock protocol. A `&T` is only
// produced while the caller holds a read, and a `&mut T` only while it holds
// the exclusive lock, so the usual RwLock bounds apply.
unsafe impl<T: Send> Send for UpgradeableRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for UpgradeableRwLock<T> {}

impl<T> UpgradeableRwLock<T> {
    /// Create a new lock wrapping `data`
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers: Condvar::new(),
            writers: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the wrapped data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Acquire a shared read hold. Reentrant.
    ///
    /// Panics if the calling thread holds the write lock.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert!(
            state.writer != Some(me),
            "cannot acquire a read hold while holding the write lock"
        );
        loop {
            let reentrant = state.read_holds.get(&me).copied().unwrap_or(0) > 0;
            if state.writer.is_none() && (state.writer_waiting == 0 || reentrant) {
                break;
            }
            self.readers.wait(&mut state);
        }
        *state.read_holds.entry(me).or_insert(0) += 1;
        state.total_reads += 1;
        ReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire a shared read hold together with the upgrade reservation.
    ///
    /// Blocks until no other thread holds the reservation, then records the
    /// caller as the reservation holder before taking the read hold.
    ///
    /// Panics if the calling thread already holds the reservation or the
    /// write lock.
    pub fn upgradeable_read(&self) -> UpgradeableReadGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert!(
            state.reservation != Some(me),
            "thread already holds the upgrade reservation"
        );
        assert!(
            state.writer != Some(me),
            "cannot reserve an upgrade while holding the write lock"
        );
        while state.reservation.is_some() {
            self.readers.wait(&mut state);
        }
        state.reservation = Some(me);
        loop {
            let reentrant = state.read_holds.get(&me).copied().unwrap_or(0) > 0;
            if state.writer.is_none() && (state.writer_waiting == 0 || reentrant) {
                break;
            }
            self.readers.wait(&mut state);
        }
        *state.read_holds.entry(me).or_insert(0) += 1;
        state.total_reads += 1;
        UpgradeableReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire the exclusive lock directly.
    ///
    /// If another thread holds the upgrade reservation, waits for that
    /// reservation to clear before taking the exclusive lock.
    ///
    /// Panics on re-entrant write acquisition, and if the calling thread
    /// holds read locks (a read-to-write transition must go through
    /// [`UpgradeableReadGuard::upgrade`]).
    pub fn write(&self) -> WriteGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert!(state.writer != Some(me), "re-entrant write acquisition");
        assert!(
            state.read_holds.get(&me).copied().unwrap_or(0) == 0,
            "cannot take the write lock while holding read locks; use an upgradeable read"
        );
        while state.reservation.is_some() {
            self.readers.wait(&mut state);
        }
        state.writer_waiting += 1;
        while state.total_reads > 0 || state.writer.is_some() {
            self.writers.wait(&mut state);
        }
        state.writer_waiting -= 1;
        state.writer = Some(me);
        WriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Number of read holds the calling thread currently has. Diagnostic.
    pub fn read_hold_count(&self) -> usize {
        let me = thread::current().id();
        self.state
            .lock()
            .read_holds
            .get(&me)
            .copied()
            .unwrap_or(0)
    }

    fn unlock_read(&self, unreserve: bool) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let holds = state
            .read_holds
            .get_mut(&me)
            .expect("read hold released by a thread that does not hold one");
        *holds -= 1;
        if *holds == 0 {
            state.read_holds.remove(&me);
        }
        state.total_reads -= 1;
        if unreserve {
            debug_assert_eq!(state.reservation, Some(me));
            state.reservation = None;
        }
        let wake_writers = state.total_reads == 0;
        drop(state);
        if unreserve {
            self.readers.notify_all();
        }
        if wake_writers {
            self.writers.notify_all();
        }
    }

    fn unlock_write(&self, unreserve: bool) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.writer, Some(me));
        state.writer = None;
        if unreserve {
            debug_assert_eq!(state.reservation, Some(me));
            state.reservation = None;
        }
        drop(state);
        self.writers.notify_all();
        self.readers.notify_all();
    }
}

impl<T: Default> Default for UpgradeableRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for UpgradeableRwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeableRwLock").finish_non_exhaustive()
    }
}

/// Shared read hold; released on drop
pub struct ReadGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: this thread holds a read; no writer can be active
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read(false);
    }
}

/// Shared read hold plus the upgrade reservation; both released on drop
pub struct UpgradeableReadGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> UpgradeableReadGuard<'a, T> {
    /// Upgrade to the exclusive lock.
    ///
    /// Releases this guard's read hold, blocks until all other readers drain,
    /// then takes the exclusive lock. The reservation is kept, so no other
    /// upgrader can interleave.
    ///
    /// Panics if the calling thread holds additional plain read guards: those
    /// holds cannot be released on its behalf, and waiting on them would
    /// deadlock.
    pub fn upgrade(self) -> UpgradedWriteGuard<'a, T> {
        let lock = self.lock;
        let me = thread::current().id();
        {
            let mut state = lock.state.lock();
            debug_assert_eq!(state.reservation, Some(me));
            assert_eq!(
                state.read_holds.get(&me).copied().unwrap_or(0),
                1,
                "cannot upgrade while holding other read guards on this thread"
            );
            state.read_holds.remove(&me);
            state.total_reads -= 1;
            state.writer_waiting += 1;
            while state.total_reads > 0 || state.writer.is_some() {
                lock.writers.wait(&mut state);
            }
            state.writer_waiting -= 1;
            state.writer = Some(me);
        }
        mem::forget(self);
        UpgradedWriteGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for UpgradeableReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: this thread holds a read; no writer can be active
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for UpgradeableReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read(true);
    }
}

/// Exclusive hold obtained directly; released on drop
pub struct WriteGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: this thread holds the exclusive lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: this thread holds the exclusive lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write(false);
    }
}

/// Exclusive hold obtained by upgrading a reserved read.
///
/// [`downgrade`](Self::downgrade) restores the pre-upgrade read state with the
/// reservation still held; dropping the guard instead releases the exclusive
/// lock and the reservation together.
pub struct UpgradedWriteGuard<'a, T> {
    lock: &'a UpgradeableRwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> UpgradedWriteGuard<'a, T> {
    /// Release the exclusive lock and re-acquire the read hold given up at
    /// upgrade time, restoring the caller to its pre-upgrade read state.
    pub fn downgrade(self) -> UpgradeableReadGuard<'a, T> {
        let lock = self.lock;
        let me = thread::current().id();
        {
            let mut state = lock.state.lock();
            debug_assert_eq!(state.writer, Some(me));
            debug_assert_eq!(state.reservation, Some(me));
            state.writer = None;
            // Immediate re-acquire: no writer can be active, and pending
            // writers wait on the restored read hold
            state.read_holds.insert(me, 1);
            state.total_reads += 1;
        }
        lock.readers.notify_all();
        mem::forget(self);
        UpgradeableReadGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for UpgradedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: this thread holds the exclusive lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for UpgradedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: this thread holds the exclusive lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for UpgradedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_read_write_basics() {
        let lock = UpgradeableRwLock::new(1u32);
        {
            let r = lock.read();
            assert_eq!(*r, 1);
            assert_eq!(lock.read_hold_count(), 1);
        }
        assert_eq!(lock.read_hold_count(), 0);
        {
            let mut w = lock.write();
            *w = 2;
        }
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn test_reentrant_reads() {
        let lock = UpgradeableRwLock::new(());
        let _a = lock.read();
        let _b = lock.read();
        assert_eq!(lock.read_hold_count(), 2);
    }

    #[test]
    fn test_concurrent_readers() {
        let lock = Arc::new(UpgradeableRwLock::new(7u32));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                let guard = lock.read();
                // All four threads hold a read simultaneously
                barrier.wait();
                *guard
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
    }

    #[test]
    fn test_writer_exclusion() {
        let lock = Arc::new(UpgradeableRwLock::new(0u64));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let active = Arc::clone(&active);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut guard = lock.write();
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    *guard += 1;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 400);
    }

    #[test]
    fn test_upgrade_cycle() {
        let lock = UpgradeableRwLock::new(vec![1]);
        let guard = lock.upgradeable_read();
        assert_eq!(guard.len(), 1);
        let mut upgraded = guard.upgrade();
        upgraded.push(2);
        let downgraded = upgraded.downgrade();
        assert_eq!(downgraded.len(), 2);
        assert_eq!(lock.read_hold_count(), 1);
        drop(downgraded);
        assert_eq!(lock.read_hold_count(), 0);
    }

    #[test]
    fn test_second_upgrader_blocks_at_reservation() {
        let lock = Arc::new(UpgradeableRwLock::new(0u32));
        let guard = lock.upgradeable_read();

        let (tx, rx) = mpsc::channel();
        let lock2 = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            let second = lock2.upgradeable_read();
            tx.send(()).unwrap();
            drop(second);
        });

        // The second upgrader must block while the reservation is held
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Completing a write-upgrade cycle releases the reservation
        let upgraded = guard.upgrade();
        let downgraded = upgraded.downgrade();
        drop(downgraded);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_upgrader_does_not_block_plain_readers() {
        let lock = Arc::new(UpgradeableRwLock::new(0u32));
        let _guard = lock.upgradeable_read();
        let lock2 = Arc::clone(&lock);
        let handle = std::thread::spawn(move || *lock2.read());
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_upgrade_waits_for_readers_to_drain() {
        let lock = Arc::new(UpgradeableRwLock::new(0u32));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let lock2 = Arc::clone(&lock);
        let reader = std::thread::spawn(move || {
            let guard = lock2.read();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        });
        started_rx.recv().unwrap();

        let lock3 = Arc::clone(&lock);
        let (done_tx, done_rx) = mpsc::channel();
        let upgrader = std::thread::spawn(move || {
            let guard = lock3.upgradeable_read();
            let mut upgraded = guard.upgrade();
            *upgraded = 9;
            done_tx.send(()).unwrap();
        });

        // Upgrade cannot complete while the plain reader holds on
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        reader.join().unwrap();
        upgrader.join().unwrap();
        assert_eq!(*lock.read(), 9);
    }

    #[test]
    #[should_panic(expected = "re-entrant write acquisition")]
    fn test_reentrant_write_panics() {
        let lock = UpgradeableRwLock::new(());
        let _w = lock.write();
        let _w2 = lock.write();
    }

    #[test]
    #[should_panic(expected = "use an upgradeable read")]
    fn test_read_to_write_without_reservation_panics() {
        let lock = UpgradeableRwLock::new(());
        let _r = lock.read();
        let _w = lock.write();
    }

    #[test]
    #[should_panic(expected = "already holds the upgrade reservation")]
    fn test_double_reservation_panics() {
        let lock = UpgradeableRwLock::new(());
        let _a = lock.upgradeable_read();
        let _b = lock.upgradeable_read();
    }
}

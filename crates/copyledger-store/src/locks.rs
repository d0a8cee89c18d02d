// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! In-process row locks.
//!
//! Each ledger row can be held by at most one open transaction. Claims use
//! [`RowLocks::try_lock`] and skip rows that are already held; plain updates
//! use [`RowLocks::lock`], which waits for the holder to finish.
//!
//! Locks live in memory only. A process that dies takes its locks with it,
//! which is what makes an abandoned claim claimable again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Identity of a transaction as seen by the lock table.
#[derive(Debug, Clone)]
pub(crate) struct LockOwner {
    id: u64,
    closed: Arc<AtomicBool>,
}

impl LockOwner {
    pub(crate) fn new(id: u64) -> Self {
        Self { id, closed: Arc::new(AtomicBool::new(false)) }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Marks the owner as finished. Must happen before its locks are released
    /// so that a lock wait still in flight cannot re-acquire on its behalf.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Result of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// The caller holds the row (possibly from an earlier request).
    Acquired,
    /// Another transaction holds the row.
    Busy,
    /// The requesting transaction has already finished.
    Closed,
}

/// Table of row locks keyed by object key.
#[derive(Debug, Default)]
pub(crate) struct RowLocks {
    holders: Mutex<HashMap<String, u64>>,
    released: Condvar,
}

impl RowLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn acquire_locked(holders: &mut HashMap<String, u64>, key: &str, owner: &LockOwner) -> Acquire {
        if owner.is_closed() {
            return Acquire::Closed;
        }
        match holders.get(key) {
            Some(holder) if *holder == owner.id => Acquire::Acquired,
            Some(_) => Acquire::Busy,
            None => {
                holders.insert(key.to_string(), owner.id);
                Acquire::Acquired
            }
        }
    }

    /// Takes the row if it is free, never waiting.
    pub(crate) fn try_lock(&self, key: &str, owner: &LockOwner) -> Acquire {
        let mut holders = self.holders.lock();
        Self::acquire_locked(&mut holders, key, owner)
    }

    /// Takes the row, waiting up to `timeout` for the current holder to release it.
    ///
    /// Blocks the calling thread.
    pub(crate) fn lock(&self, key: &str, owner: &LockOwner, timeout: Duration) -> Acquire {
        let deadline = Instant::now() + timeout;
        let mut holders = self.holders.lock();
        loop {
            match Self::acquire_locked(&mut holders, key, owner) {
                Acquire::Busy => {}
                outcome => return outcome,
            }
            if self.released.wait_until(&mut holders, deadline).timed_out() {
                return Self::acquire_locked(&mut holders, key, owner);
            }
        }
    }

    /// Releases one row if `owner` holds it.
    pub(crate) fn release(&self, key: &str, owner: u64) {
        let mut holders = self.holders.lock();
        if holders.get(key) == Some(&owner) {
            holders.remove(key);
            self.released.notify_all();
        }
    }

    /// Releases every row held by `owner`, returning how many were held.
    pub(crate) fn release_all(&self, owner: u64) -> usize {
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|_, holder| *holder != owner);
        let released = before - holders.len();
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    /// The transaction currently holding `key`, if any.
    pub(crate) fn holder(&self, key: &str) -> Option<u64> {
        self.holders.lock().get(key).copied()
    }

    /// Number of rows currently held.
    pub(crate) fn held(&self) -> usize {
        self.holders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_try_lock_skips_held_rows() {
        let locks = RowLocks::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);

        assert_eq!(locks.try_lock("k", &a), Acquire::Acquired);
        assert_eq!(locks.try_lock("k", &a), Acquire::Acquired);
        assert_eq!(locks.try_lock("k", &b), Acquire::Busy);
        assert_eq!(locks.holder("k"), Some(1));

        locks.release("k", 2);
        assert_eq!(locks.holder("k"), Some(1));
        locks.release("k", 1);
        assert_eq!(locks.try_lock("k", &b), Acquire::Acquired);
    }

    #[test]
    fn test_release_all() {
        let locks = RowLocks::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        locks.try_lock("x", &a);
        locks.try_lock("y", &a);
        locks.try_lock("z", &b);

        assert_eq!(locks.release_all(1), 2);
        assert_eq!(locks.held(), 1);
        assert_eq!(locks.release_all(1), 0);
    }

    #[test]
    fn test_lock_times_out() {
        let locks = RowLocks::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        locks.try_lock("k", &a);

        let started = Instant::now();
        assert_eq!(locks.lock("k", &b, Duration::from_millis(50)), Acquire::Busy);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_lock_waits_for_release() {
        let locks = Arc::new(RowLocks::new());
        let a = LockOwner::new(1);
        locks.try_lock("k", &a);

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.lock("k", &LockOwner::new(2), Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        locks.release_all(1);

        assert_eq!(waiter.join().unwrap(), Acquire::Acquired);
        assert_eq!(locks.holder("k"), Some(2));
    }

    #[test]
    fn test_closed_owner_cannot_acquire() {
        let locks = RowLocks::new();
        let a = LockOwner::new(1);
        a.close();
        assert_eq!(locks.try_lock("k", &a), Acquire::Closed);
        assert_eq!(locks.lock("k", &a, Duration::from_millis(1)), Acquire::Closed);
        assert_eq!(locks.held(), 0);
    }
}

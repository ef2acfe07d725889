//! Re-entrant mutual exclusion with owner queries.
//!
//! `ReentrantLock<T>` admits one owning thread at a time. The owner may
//! acquire it again without blocking; each acquisition must be matched by a
//! release. Unlike `std::sync::Mutex`, the lock can answer whether the
//! *current* thread is its holder, which the session layer uses to choose
//! between running work inline and deferring it.
//!
//! # Example
//!
//! ```
//! use session_access::sync::ReentrantLock;
//!
//! let lock = ReentrantLock::new(5);
//! let outer = lock.lock();
//! let inner = lock.lock(); // same thread: does not block
//! assert_eq!(lock.hold_count(), 2);
//! assert_eq!(*inner + *outer, 10);
//! ```

#![allow(unsafe_code)]

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::error::AccessError;

/// Snapshot of lock contention counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    /// Total number of outermost acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for another thread.
    pub contentions: u64,
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    holds: usize,
}

/// A re-entrant lock protecting a value of type `T`.
///
/// Shared references to `T` are only handed out to the owning thread, so
/// `T` does not need to be `Sync`; wrapping a `RefCell` is the intended
/// way to get mutable access.
pub struct ReentrantLock<T> {
    owner: Mutex<Owner>,
    released: Condvar,
    acquisitions: AtomicU64,
    contentions: AtomicU64,
    data: T,
}

// Safety: `data` is only reachable through a guard, and guards only exist on
// the thread recorded in `owner`. At most one thread observes `T` at a time,
// which is exactly what `T: Send` permits.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    /// Creates an unlocked lock around `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            owner: Mutex::new(Owner::default()),
            released: Condvar::new(),
            acquisitions: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            data: value,
        }
    }

    /// Acquires the lock, blocking while another thread holds it.
    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        self.acquire();
        ReentrantGuard::new(self)
    }

    /// Acquires the lock only if that is possible without waiting.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_, T>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match owner.thread {
            Some(holder) if holder == me => owner.holds += 1,
            Some(_) => return None,
            None => {
                owner.thread = Some(me);
                owner.holds = 1;
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(owner);
        Some(ReentrantGuard::new(self))
    }

    /// Acquires one level of the lock without producing a guard.
    ///
    /// Must be balanced by [`unlock`](Self::unlock) on the same thread.
    pub(crate) fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if owner.thread == Some(me) {
            owner.holds += 1;
            return;
        }

        let mut contended = false;
        while owner.thread.is_some() {
            contended = true;
            self.released.wait(&mut owner);
        }
        owner.thread = Some(me);
        owner.holds = 1;
        drop(owner);

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contentions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases one level of the lock.
    ///
    /// Returns the number of levels still held by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::IllegalState`] if the current thread does not
    /// hold the lock.
    pub(crate) fn unlock(&self) -> Result<usize, AccessError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if owner.thread != Some(me) {
            return Err(AccessError::illegal_state(
                "attempted to unlock a lock that is not held by the current thread",
            ));
        }
        owner.holds -= 1;
        let remaining = owner.holds;
        if remaining == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
        Ok(remaining)
    }

    /// Returns true if the current thread owns the lock.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.lock().thread == Some(thread::current().id())
    }

    /// Returns true if any thread owns the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner.lock().thread.is_some()
    }

    /// Returns how many levels the current thread holds (0 if not the owner).
    #[must_use]
    pub fn hold_count(&self) -> usize {
        let owner = self.owner.lock();
        if owner.thread == Some(thread::current().id()) {
            owner.holds
        } else {
            0
        }
    }

    /// Returns the contention counters.
    #[must_use]
    pub fn metrics(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for ReentrantLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.lock();
        f.debug_struct("ReentrantLock")
            .field("owner", &owner.thread)
            .field("holds", &owner.holds)
            .finish_non_exhaustive()
    }
}

impl<T: Default> Default for ReentrantLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Proof that the current thread holds one level of a [`ReentrantLock`].
///
/// Guards are `!Send`: a level acquired on one thread must be released on
/// the same thread.
#[must_use = "if unused the lock level is released immediately"]
pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> ReentrantGuard<'a, T> {
    fn new(lock: &'a ReentrantLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ReentrantGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantGuard").finish_non_exhaustive()
    }
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.lock.unlock();
        debug_assert!(released.is_ok(), "guard released on a foreign thread");
    }
}

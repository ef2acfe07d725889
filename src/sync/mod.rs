//! Synchronization primitives for session access.
//!
//! # Primitives
//!
//! - [`ReentrantLock`]: Re-entrant mutual exclusion that can report whether
//!   the current thread is the holder
//! - [`held`]: Per-thread registry of held session locks, used for
//!   deadlock self-checks
//!
//! The lock only ever hands out its protected value to the owning thread,
//! and guards are `!Send`, so a level acquired on one thread is always
//! released on that thread.

pub mod held;
mod reentrant;

pub use reentrant::{LockMetricsSnapshot, ReentrantGuard, ReentrantLock};

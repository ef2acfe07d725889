//! Per-thread record of held session locks.
//!
//! Each thread keeps a stack of the sessions whose lock it currently holds
//! (outermost acquisition only). This is how a blocking wait detects that it
//! would deadlock, and how `access_synchronously` refuses to nest two
//! different sessions on one thread.

use std::cell::RefCell;

use crate::types::SessionId;

thread_local! {
    static HELD: RefCell<Vec<SessionId>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn push(id: SessionId) {
    HELD.with(|held| held.borrow_mut().push(id));
}

pub(crate) fn pop(id: SessionId) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&h| h == id) {
            held.remove(pos);
        }
    });
}

/// Returns the most recently locked session on this thread.
#[must_use]
pub fn current_session() -> Option<SessionId> {
    HELD.with(|held| held.borrow().last().copied())
}

/// Returns true if this thread holds any session lock.
#[must_use]
pub fn holds_any_session_lock() -> bool {
    HELD.with(|held| !held.borrow().is_empty())
}

/// Returns true if this thread holds the lock of a session other than `id`.
#[must_use]
pub fn holds_other_session_lock(id: SessionId) -> bool {
    HELD.with(|held| held.borrow().iter().any(|&h| h != id))
}

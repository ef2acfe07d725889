//! Result slots and the futures handed back by `Session::access`.
//!
//! A [`ResultSlot`] records the lifecycle of one queued task:
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │           │    └──► Failed
//!    └───────────┴───────► Cancelled
//! ```
//!
//! Transitions are one-way. Cancelling a running task does not interrupt it;
//! it only stops the outcome from being delivered to waiters.
//!
//! [`AccessFuture`] is the caller's view of the slot. Its blocking
//! [`get`](AccessFuture::get) refuses to wait while the calling thread holds
//! a session lock: the task may need that very lock, and failing fast is
//! easier to diagnose than a silent hang.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AccessError, CommandError};
use crate::sync::held;
use crate::types::TaskId;

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Queued, not yet started.
    Pending,
    /// Currently executing on the lock holder's thread.
    Running,
    /// Finished successfully.
    Completed,
    /// The command returned an error or panicked.
    Failed,
    /// Cancelled before a result was delivered.
    Cancelled,
}

impl TaskState {
    /// Returns true for states that will never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
struct SlotInner {
    state: TaskState,
    failure: Option<Arc<CommandError>>,
}

/// Shared completion cell between a pending task and its future.
#[derive(Debug)]
pub(crate) struct ResultSlot {
    inner: Mutex<SlotInner>,
    done: Condvar,
}

impl ResultSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: TaskState::Pending,
                failure: None,
            }),
            done: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Moves `Pending -> Running`. Returns false if the task was cancelled.
    pub(crate) fn try_start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Pending {
            inner.state = TaskState::Running;
            true
        } else {
            false
        }
    }

    pub(crate) fn complete(&self) {
        self.finish(TaskState::Completed, None);
    }

    pub(crate) fn fail(&self, failure: Arc<CommandError>) {
        self.finish(TaskState::Failed, Some(failure));
    }

    fn finish(&self, state: TaskState, failure: Option<Arc<CommandError>>) {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Running {
            return;
        }
        inner.state = state;
        inner.failure = failure;
        drop(inner);
        self.done.notify_all();
    }

    /// Cancels the task unless it already reached a terminal state.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = TaskState::Cancelled;
        drop(inner);
        self.done.notify_all();
        true
    }

    fn outcome(inner: &SlotInner) -> Option<Result<(), AccessError>> {
        match inner.state {
            TaskState::Pending | TaskState::Running => None,
            TaskState::Completed => Some(Ok(())),
            TaskState::Cancelled => Some(Err(AccessError::Cancelled)),
            TaskState::Failed => Some(Err(inner.failure.as_ref().map_or_else(
                || AccessError::illegal_state("failed task without a recorded cause"),
                |cause| AccessError::ExecutionFailed(Arc::clone(cause)),
            ))),
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Result<(), AccessError>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(outcome) = Self::outcome(&inner) {
                return Some(outcome);
            }
            match deadline {
                None => self.done.wait(&mut inner),
                Some(deadline) => {
                    if self.done.wait_until(&mut inner, deadline).timed_out() {
                        return Self::outcome(&inner);
                    }
                }
            }
        }
    }
}

/// Handle to the outcome of a task submitted with `Session::access`.
///
/// Dropping the future does not cancel the task.
#[derive(Debug, Clone)]
pub struct AccessFuture {
    task_id: TaskId,
    slot: Arc<ResultSlot>,
}

impl AccessFuture {
    pub(crate) fn new(task_id: TaskId, slot: Arc<ResultSlot>) -> Self {
        Self { task_id, slot }
    }

    /// Returns the id of the underlying task.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.slot.state()
    }

    /// Returns true once the task completed, failed or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Attempts to cancel the task.
    ///
    /// A pending task will never run. A running task keeps running, but its
    /// outcome is no longer delivered. Returns false if the task already
    /// finished.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    /// Blocks until the task finishes.
    ///
    /// # Errors
    ///
    /// - [`AccessError::IllegalState`] if the calling thread holds any session
    ///   lock. The check is made before looking at the task, so it fails the
    ///   same way whether or not the task already ran.
    /// - [`AccessError::ExecutionFailed`] carrying the command's error.
    /// - [`AccessError::Cancelled`] if the task was cancelled.
    pub fn get(&self) -> Result<(), AccessError> {
        if held::holds_any_session_lock() {
            return Err(AccessError::illegal_state(
                "cannot wait for an access task while holding a session lock; \
                 this restriction is intended to help avoid deadlocks",
            ));
        }
        self.slot
            .wait(None)
            .unwrap_or_else(|| Err(AccessError::illegal_state("unbounded wait returned early")))
    }

    /// Blocks for at most `timeout` waiting for the task.
    ///
    /// No lock self-check is made: a bounded wait cannot hang forever.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`AccessError::Timeout`] when the wait
    /// elapses first.
    pub fn get_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
        let deadline = Instant::now() + timeout;
        self.slot
            .wait(Some(deadline))
            .unwrap_or(Err(AccessError::Timeout(timeout)))
    }

    /// Returns the outcome if the task already finished.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<(), AccessError>> {
        ResultSlot::outcome(&self.slot.inner.lock())
    }
}

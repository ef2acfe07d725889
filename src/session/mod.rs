//! Sessions: lock-protected state plus a queue of deferred access tasks.
//!
//! A [`Session`] owns a value `S` that may only be touched while holding the
//! session lock. Threads that do not hold the lock submit work with
//! [`Session::access`]; the work is queued and run by whichever thread holds
//! the lock when it releases it (or when it purges the queue explicitly).
//!
//! The lock is re-entrant. Only the outermost release drains the queue:
//!
//! ```text
//! lock()            hold 1  stamp last_locked
//!   lock()          hold 2
//!   drop            hold 1
//! drop              drain queue, stamp last_unlocked, release
//!                   queue refilled meanwhile? try_lock and drain again
//! ```
//!
//! [`SessionGuard`] is the proof that the current thread holds the lock; it
//! is the only way to reach the state, so code that has no guard cannot
//! touch the state by construction.

pub mod lock_check;

use parking_lot::{Mutex, RwLock};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::AccessConfig;
use crate::delivery::ErrorHandler;
use crate::error::{AccessError, CommandError};
use crate::service::ServiceContext;
use crate::sync::{held, LockMetricsSnapshot, ReentrantGuard, ReentrantLock};
use crate::task::{AccessFuture, Command, PendingTask};
use crate::types::SessionId;

const NOT_LOCKED_MESSAGE: &str =
    "cannot run pending access tasks without holding the session lock";

/// A handle to a session. Clones share the same session.
///
/// Dropping the last handle cancels every task still waiting in the queue.
pub struct Session<S> {
    inner: Arc<SessionInner<S>>,
}

struct SessionInner<S> {
    id: SessionId,
    key: Option<String>,
    lock: ReentrantLock<RefCell<S>>,
    queue: Mutex<VecDeque<PendingTask<S>>>,
    last_locked: AtomicU64,
    last_unlocked: AtomicU64,
    held_since: Mutex<Option<Instant>>,
    error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    closed: AtomicBool,
    context: Arc<ServiceContext>,
}

impl<S> Session<S> {
    /// Creates a standalone session with the default configuration.
    #[must_use]
    pub fn new(state: S) -> Self {
        Self::with_context(state, None, Arc::new(ServiceContext::default()))
    }

    /// Creates a standalone session with `config`.
    #[must_use]
    pub fn with_config(state: S, config: AccessConfig) -> Self {
        Self::with_context(state, None, Arc::new(ServiceContext::from_config(config)))
    }

    pub(crate) fn with_context(
        state: S,
        key: Option<String>,
        context: Arc<ServiceContext>,
    ) -> Self {
        let id = SessionId::next();
        tracing::debug!(session_id = %id, key = ?key, "session created");
        Self {
            inner: Arc::new(SessionInner {
                id,
                key,
                lock: ReentrantLock::new(RefCell::new(state)),
                queue: Mutex::new(VecDeque::new()),
                last_locked: AtomicU64::new(0),
                last_unlocked: AtomicU64::new(0),
                held_since: Mutex::new(None),
                error_handler: RwLock::new(None),
                closed: AtomicBool::new(false),
                context,
            }),
        }
    }

    /// Blocks until the current thread holds the session lock.
    pub fn lock(&self) -> SessionGuard<'_, S> {
        let guard = self.inner.lock.lock();
        SessionGuard::new(self, guard, true)
    }

    /// Acquires the session lock only if that is possible without waiting.
    pub fn try_lock(&self) -> Option<SessionGuard<'_, S>> {
        self.inner
            .lock
            .try_lock()
            .map(|guard| SessionGuard::new(self, guard, true))
    }

    /// Returns true if the current thread holds the session lock.
    #[must_use]
    pub fn has_lock(&self) -> bool {
        self.inner.lock.is_held_by_current_thread()
    }

    /// Queues `command` to run while the session lock is held.
    ///
    /// Never blocks and never runs the command on the calling thread, even
    /// if that thread holds the lock; the command then runs when the lock is
    /// released. With eager purging enabled and the lock free, the calling
    /// thread takes the lock briefly and drains the queue.
    pub fn access<F>(&self, command: F) -> AccessFuture
    where
        F: FnOnce(&SessionGuard<'_, S>) -> Result<(), CommandError> + Send + 'static,
    {
        self.access_command(Command::new(command))
    }

    /// [`access`](Self::access) for a prepared [`Command`].
    pub fn access_command(&self, command: Command<S>) -> AccessFuture {
        let interceptors = self.inner.context.command_interceptors.clone();
        let (task, future) = PendingTask::new(command, interceptors);
        if self.is_closed() {
            task.cancel();
            tracing::debug!(
                session_id = %self.id(),
                task_id = %task.id(),
                "access on closed session; task cancelled"
            );
            return future;
        }

        let pending = {
            let mut queue = self.inner.queue.lock();
            queue.push_back(task);
            queue.len()
        };
        tracing::trace!(
            session_id = %self.id(),
            task_id = %future.task_id(),
            pending,
            "access task queued"
        );

        if self.inner.context.config.eager_purge && !self.has_lock() {
            self.try_purge_access_queue();
        }
        future
    }

    /// Runs `command` with the session lock held and waits for it.
    ///
    /// If the current thread already holds the lock the command runs inline.
    /// Otherwise the lock is acquired, the command runs, and releasing the
    /// lock drains whatever was queued meanwhile. The command's error is
    /// returned to the caller rather than delivered to an error handler.
    ///
    /// # Errors
    ///
    /// - [`AccessError::SessionClosed`] if the session was closed.
    /// - [`AccessError::IllegalState`] if the current thread holds the lock
    ///   of a different session.
    /// - [`AccessError::ExecutionFailed`] if the command fails or panics.
    pub fn access_synchronously<F>(&self, command: F) -> Result<(), AccessError>
    where
        F: FnOnce(&SessionGuard<'_, S>) -> Result<(), CommandError>,
    {
        if self.is_closed() {
            return Err(AccessError::SessionClosed);
        }
        if !self.has_lock() && held::holds_other_session_lock(self.id()) {
            return Err(AccessError::illegal_state(format!(
                "cannot access {} while holding the lock of {}",
                self.id(),
                held::current_session()
                    .map_or_else(|| "another session".to_string(), |id| id.to_string()),
            )));
        }

        let guard = self.lock();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| command(&guard)))
            .unwrap_or_else(|payload| Err(CommandError::from_panic(&*payload)));
        drop(guard);
        result.map_err(|err| AccessError::ExecutionFailed(Arc::new(err)))
    }

    /// Runs every queued task. The current thread must hold the lock.
    ///
    /// Tasks queued while draining are run too. The lock precondition is
    /// checked with the configured strategy; when the lock is not held and
    /// the strategy lets the call through, nothing is drained. If the state
    /// is borrowed on this thread the tasks stay queued until the lock is
    /// released; [`SessionGuard::run_pending_access_tasks`] rules that out
    /// at compile time.
    ///
    /// # Errors
    ///
    /// [`AccessError::IllegalState`] when the lock is not held and the
    /// strategy is `Throw`.
    pub fn run_pending_access_tasks(&self) -> Result<(), AccessError> {
        let held = self.has_lock();
        self.inner.context.lock_check.check(held, NOT_LOCKED_MESSAGE)?;
        if held {
            let guard = self.lock();
            self.drain(&guard);
        }
        Ok(())
    }

    /// Makes sure no task remains queued, taking the lock if needed.
    ///
    /// A holder that has the state borrowed leaves the tasks for its own
    /// release.
    pub fn ensure_access_queue_purged(&self) {
        if self.has_lock() {
            let guard = self.lock();
            self.drain(&guard);
            return;
        }
        while !self.queue_is_empty() {
            drop(self.lock());
        }
    }

    /// Drains the queue if the lock can be taken without waiting.
    ///
    /// Returns true when the queue was observed empty afterwards, false when
    /// another thread held the lock (that thread drains on release).
    pub fn try_purge_access_queue(&self) -> bool {
        if self.has_lock() {
            let guard = self.lock();
            self.drain(&guard);
            return self.queue_is_empty();
        }
        while !self.queue_is_empty() {
            let Some(guard) = self.inner.lock.try_lock() else {
                return false;
            };
            drop(SessionGuard::new(self, guard, false));
        }
        true
    }

    /// Applies the configured lock check to the current thread.
    ///
    /// # Errors
    ///
    /// [`AccessError::IllegalState`] when the lock is not held and the
    /// strategy is `Throw`.
    pub fn check_has_lock(&self, message: &str) -> Result<(), AccessError> {
        self.inner.context.lock_check.check(self.has_lock(), message)
    }

    /// Closes the session and cancels every queued task.
    ///
    /// Closed sessions refuse synchronous access and cancel new tasks on
    /// submission. The state stays reachable through [`lock`](Self::lock).
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.inner.cancel_all();
        tracing::debug!(session_id = %self.id(), cancelled, "session closed");
    }

    fn drain(&self, guard: &SessionGuard<'_, S>) {
        if guard.guard.try_borrow_mut().is_err() {
            tracing::debug!(
                session_id = %self.id(),
                pending = self.pending_count(),
                "session state is borrowed; queued tasks left for the release"
            );
            return;
        }
        let mut ran = 0_usize;
        loop {
            let next = self.inner.queue.lock().pop_front();
            let Some(task) = next else { break };
            task.run(guard);
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(session_id = %self.id(), ran, "access queue drained");
        }
    }

    /// Returns the configured session-level error handler.
    #[must_use]
    pub fn error_handler(&self) -> Option<Arc<dyn ErrorHandler>> {
        self.inner.error_handler.read().clone()
    }

    /// Sets the handler for failures of tasks without their own handler.
    pub fn set_error_handler(&self, handler: Option<Arc<dyn ErrorHandler>>) {
        *self.inner.error_handler.write() = handler;
    }

    pub(crate) fn default_error_handler(&self) -> Arc<dyn ErrorHandler> {
        Arc::clone(&self.inner.context.default_error_handler)
    }

    /// Unique id of the session.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Key the owning service stores the session under.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn queue_is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// When the lock was last acquired by an outermost `lock`.
    #[must_use]
    pub fn last_locked(&self) -> Option<SystemTime> {
        from_millis(self.inner.last_locked.load(Ordering::Acquire))
    }

    /// When the lock was last fully released.
    #[must_use]
    pub fn last_unlocked(&self) -> Option<SystemTime> {
        from_millis(self.inner.last_unlocked.load(Ordering::Acquire))
    }

    /// A snapshot of the lock's state for monitoring.
    #[must_use]
    pub fn diagnostics(&self) -> LockDiagnostics {
        LockDiagnostics {
            session_id: self.id(),
            locked: self.inner.lock.is_locked(),
            held_for: self.inner.held_since.lock().map(|since| since.elapsed()),
            pending: self.pending_count(),
            last_locked: self.last_locked(),
            last_unlocked: self.last_unlocked(),
            metrics: self.inner.lock.metrics(),
        }
    }

    fn mark_locked(&self) {
        held::push(self.id());
        *self.inner.held_since.lock() = Some(Instant::now());
        let unlocked = self.inner.last_unlocked.load(Ordering::Acquire);
        self.inner
            .last_locked
            .fetch_max(now_millis().max(unlocked), Ordering::AcqRel);
    }

    fn mark_unlocked(&self) {
        let locked = self.inner.last_locked.load(Ordering::Acquire);
        self.inner
            .last_unlocked
            .fetch_max(now_millis().max(locked), Ordering::AcqRel);
        *self.inner.held_since.lock() = None;
        held::pop(self.id());
    }
}

impl<S> SessionInner<S> {
    fn cancel_all(&self) -> usize {
        let tasks: Vec<_> = self.queue.lock().drain(..).collect();
        tasks.iter().filter(|task| task.cancel()).count()
    }
}

impl<S> Drop for SessionInner<S> {
    fn drop(&mut self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            tracing::debug!(session_id = %self.id, cancelled, "session dropped with queued tasks");
        }
    }
}

impl<S> Clone for Session<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a session's lock.
///
/// Gives access to the state. Dropping the outermost guard runs the queued
/// tasks before the lock is released. Guards are `!Send`.
#[must_use = "if unused the session lock is released immediately"]
pub struct SessionGuard<'a, S> {
    session: &'a Session<S>,
    guard: ReentrantGuard<'a, RefCell<S>>,
    // Dropped after `guard`, i.e. once the lock is released.
    after_release: AfterRelease<'a, S>,
}

impl<'a, S> SessionGuard<'a, S> {
    fn new(session: &'a Session<S>, guard: ReentrantGuard<'a, RefCell<S>>, recheck: bool) -> Self {
        if session.inner.lock.hold_count() == 1 {
            session.mark_locked();
        }
        Self {
            session,
            guard,
            after_release: AfterRelease {
                session,
                recheck,
                armed: false,
            },
        }
    }

    /// The session this guard locks.
    #[must_use]
    pub fn session(&self) -> &'a Session<S> {
        self.session
    }

    /// Borrows the state.
    ///
    /// # Panics
    ///
    /// If the state is currently borrowed mutably on this thread.
    #[must_use]
    pub fn state(&self) -> Ref<'_, S> {
        RefCell::borrow(&self.guard)
    }

    /// Borrows the state mutably.
    ///
    /// # Panics
    ///
    /// If the state is currently borrowed on this thread.
    #[must_use]
    pub fn state_mut(&self) -> RefMut<'_, S> {
        RefCell::borrow_mut(&self.guard)
    }

    /// Runs every queued task now, keeping the lock.
    ///
    /// Needs `&mut self`, so no `state()` or `state_mut()` borrow taken
    /// through this guard can be alive while the tasks run.
    pub fn run_pending_access_tasks(&mut self) {
        self.session.drain(self);
    }

    /// How many levels of the lock the current thread holds.
    #[must_use]
    pub fn hold_count(&self) -> usize {
        self.session.inner.lock.hold_count()
    }
}

impl<S> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        if self.session.inner.lock.hold_count() != 1 {
            return;
        }
        let panicking = thread::panicking();
        if panicking {
            tracing::warn!(
                session_id = %self.session.id(),
                pending = self.session.pending_count(),
                "releasing session lock during a panic; queued tasks left for the next holder"
            );
        } else {
            self.session.drain(self);
        }
        self.session.mark_unlocked();
        self.after_release.armed = !panicking;
    }
}

impl<S> fmt::Debug for SessionGuard<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session_id", &self.session.id())
            .field("hold_count", &self.hold_count())
            .finish_non_exhaustive()
    }
}

struct AfterRelease<'a, S> {
    session: &'a Session<S>,
    recheck: bool,
    armed: bool,
}

impl<S> Drop for AfterRelease<'_, S> {
    fn drop(&mut self) {
        // A task may have been queued between the drain and the release;
        // nobody else is guaranteed to pick it up.
        if self.armed && self.recheck && !self.session.queue_is_empty() {
            self.session.try_purge_access_queue();
        }
    }
}

/// Point-in-time view of a session's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDiagnostics {
    /// Session described.
    pub session_id: SessionId,
    /// Whether any thread holds the lock.
    pub locked: bool,
    /// How long the current holder has held the lock.
    pub held_for: Option<Duration>,
    /// Number of queued tasks.
    pub pending: usize,
    /// Last outermost acquisition.
    pub last_locked: Option<SystemTime>,
    /// Last full release.
    pub last_unlocked: Option<SystemTime>,
    /// Contention counters.
    pub metrics: LockMetricsSnapshot,
}

impl LockDiagnostics {
    /// Returns true if the lock has been held for longer than `threshold`.
    #[must_use]
    pub fn held_longer_than(&self, threshold: Duration) -> bool {
        self.held_for.is_some_and(|held| held > threshold)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .max(1)
}

fn from_millis(millis: u64) -> Option<SystemTime> {
    (millis > 0).then(|| UNIX_EPOCH + Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::lock_check::LockCheckStrategy;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn session_with(strategy: LockCheckStrategy) -> Session<Vec<u32>> {
        Session::with_config(Vec::new(), AccessConfig::default().with_lock_check(strategy))
    }

    #[test]
    fn queued_tasks_run_in_order_on_release() {
        init_test("queued_tasks_run_in_order_on_release");
        let session = Session::new(Vec::new());
        let guard = session.lock();
        let futures: Vec<_> = (0..5)
            .map(|i| {
                session.access(move |guard: &SessionGuard<'_, Vec<u32>>| {
                    guard.state_mut().push(i);
                    Ok(())
                })
            })
            .collect();
        let pending = session.pending_count();
        crate::assert_with_log!(pending == 5, "queued while held", 5, pending);
        drop(guard);

        let order = session.lock().state().clone();
        crate::assert_with_log!(order == [0, 1, 2, 3, 4], "fifo", [0, 1, 2, 3, 4], order);
        let all_done = futures.iter().all(AccessFuture::is_done);
        crate::assert_with_log!(all_done, "all done", true, all_done);
        crate::test_complete!("queued_tasks_run_in_order_on_release");
    }

    #[test]
    fn nested_release_does_not_drain() {
        init_test("nested_release_does_not_drain");
        let session = Session::new(Vec::new());
        let outer = session.lock();
        let inner = session.lock();
        session.access(|guard: &SessionGuard<'_, Vec<u32>>| {
            guard.state_mut().push(1);
            Ok(())
        });
        drop(inner);
        let pending = session.pending_count();
        crate::assert_with_log!(pending == 1, "still queued", 1, pending);
        drop(outer);
        let pending = session.pending_count();
        crate::assert_with_log!(pending == 0, "drained on outer release", 0, pending);
        crate::test_complete!("nested_release_does_not_drain");
    }

    #[test]
    fn access_synchronously_is_inline_when_held() {
        init_test("access_synchronously_is_inline_when_held");
        let session = Session::new(Vec::new());
        let guard = session.lock();
        let result = session.access_synchronously(|guard| {
            guard.state_mut().push(7);
            Ok(())
        });
        crate::assert_with_log!(result.is_ok(), "ran", true, result.is_ok());
        let value = guard.state().clone();
        crate::assert_with_log!(value == [7], "inline", [7], value);
        drop(guard);
        crate::test_complete!("access_synchronously_is_inline_when_held");
    }

    #[test]
    fn access_synchronously_refuses_other_session() {
        init_test("access_synchronously_refuses_other_session");
        let first: Session<Vec<u32>> = Session::new(Vec::new());
        let second: Session<Vec<u32>> = Session::new(Vec::new());
        let _guard = first.lock();
        let result = second.access_synchronously(|_| Ok(()));
        let illegal = result.as_ref().is_err_and(AccessError::is_illegal_state);
        crate::assert_with_log!(illegal, "other session held", true, result);
        crate::test_complete!("access_synchronously_refuses_other_session");
    }

    #[test]
    fn access_synchronously_returns_command_error() {
        init_test("access_synchronously_returns_command_error");
        let session: Session<Vec<u32>> = Session::new(Vec::new());
        let result = session.access_synchronously(|_| Err(CommandError::msg("nope")));
        let cause = result.as_ref().err().and_then(AccessError::cause).map(ToString::to_string);
        crate::assert_with_log!(cause.as_deref() == Some("nope"), "cause", Some("nope"), cause);
        let locked = session.diagnostics().locked;
        crate::assert_with_log!(!locked, "released", false, locked);
        crate::test_complete!("access_synchronously_returns_command_error");
    }

    #[test]
    fn run_pending_without_lock_follows_strategy() {
        init_test("run_pending_without_lock_follows_strategy");
        let throwing = session_with(LockCheckStrategy::Throw);
        let err = throwing.run_pending_access_tasks().unwrap_err();
        crate::assert_with_log!(err.is_illegal_state(), "throw", true, err.is_illegal_state());

        let logging = session_with(LockCheckStrategy::Log);
        logging.access(|guard: &SessionGuard<'_, Vec<u32>>| {
            guard.state_mut().push(1);
            Ok(())
        });
        let result = logging.run_pending_access_tasks();
        crate::assert_with_log!(result.is_ok(), "log passes", true, result.is_ok());
        let pending = logging.pending_count();
        crate::assert_with_log!(pending == 1, "not drained without lock", 1, pending);
        crate::test_complete!("run_pending_without_lock_follows_strategy");
    }

    #[test]
    fn run_pending_drains_tasks_queued_while_draining() {
        init_test("run_pending_drains_tasks_queued_while_draining");
        let session = Session::new(Vec::new());
        let guard = session.lock();
        session.access(|guard: &SessionGuard<'_, Vec<u32>>| {
            guard.state_mut().push(1);
            guard.session().access(|guard: &SessionGuard<'_, Vec<u32>>| {
                guard.state_mut().push(2);
                Ok(())
            });
            Ok(())
        });
        session.run_pending_access_tasks().expect("holder may drain");
        let state = guard.state().clone();
        crate::assert_with_log!(state == [1, 2], "chained", [1, 2], state);
        drop(guard);
        crate::test_complete!("run_pending_drains_tasks_queued_while_draining");
    }

    #[test]
    fn borrowed_state_defers_drain_to_release() {
        init_test("borrowed_state_defers_drain_to_release");
        let session = Session::new(Vec::new());
        let guard = session.lock();
        let future = session.access(|guard: &SessionGuard<'_, Vec<u32>>| {
            guard.state_mut().push(1);
            Ok(())
        });

        let borrowed = guard.state();
        let result = session.run_pending_access_tasks();
        crate::assert_with_log!(result.is_ok(), "holder passes the check", true, result);
        let done = future.is_done();
        crate::assert_with_log!(!done, "left queued while borrowed", false, done);
        let purged = session.try_purge_access_queue();
        crate::assert_with_log!(!purged, "purge reports leftovers", false, purged);
        session.ensure_access_queue_purged();
        let pending = session.pending_count();
        crate::assert_with_log!(pending == 1, "still queued", 1, pending);
        drop(borrowed);
        drop(guard);

        let result = future.get();
        crate::assert_with_log!(result.is_ok(), "ran on release", true, result);
        let state = session.lock().state().clone();
        crate::assert_with_log!(state == [1], "state updated once", [1], state);
        crate::test_complete!("borrowed_state_defers_drain_to_release");
    }

    #[test]
    fn guard_drains_while_keeping_the_lock() {
        init_test("guard_drains_while_keeping_the_lock");
        let session = Session::new(Vec::new());
        let mut guard = session.lock();
        guard.state_mut().push(0);
        session.access(|guard: &SessionGuard<'_, Vec<u32>>| {
            guard.state_mut().push(1);
            Ok(())
        });
        guard.run_pending_access_tasks();
        let state = guard.state().clone();
        crate::assert_with_log!(state == [0, 1], "drained in place", [0, 1], state);
        let held = session.has_lock();
        crate::assert_with_log!(held, "lock kept", true, held);
        drop(guard);
        crate::test_complete!("guard_drains_while_keeping_the_lock");
    }

    #[test]
    fn timestamps_are_ordered() {
        init_test("timestamps_are_ordered");
        let session = Session::new(());
        let never = session.last_locked();
        crate::assert_with_log!(never.is_none(), "never locked", None::<SystemTime>, never);
        let guard = session.lock();
        let locked = session.last_locked();
        crate::assert_with_log!(locked.is_some(), "stamped", true, locked);
        let held = session.diagnostics().held_for.is_some();
        crate::assert_with_log!(held, "held_for while locked", true, held);
        drop(guard);
        let unlocked = session.last_unlocked();
        crate::assert_with_log!(unlocked >= locked, "unlock after lock", locked, unlocked);
        crate::test_complete!("timestamps_are_ordered");
    }

    #[test]
    fn close_cancels_queue_and_refuses_work() {
        init_test("close_cancels_queue_and_refuses_work");
        let session = Session::new(());
        let guard = session.lock();
        let queued = session.access(|_: &SessionGuard<'_, ()>| Ok(()));
        session.close();
        drop(guard);
        let cancelled = queued.is_cancelled();
        crate::assert_with_log!(cancelled, "queued cancelled", true, cancelled);

        let late = session.access(|_: &SessionGuard<'_, ()>| Ok(()));
        crate::assert_with_log!(late.is_cancelled(), "late cancelled", true, late.is_cancelled());
        let sync = session.access_synchronously(|_| Ok(()));
        let closed = matches!(sync, Err(AccessError::SessionClosed));
        crate::assert_with_log!(closed, "sync refused", true, sync);
        crate::test_complete!("close_cancels_queue_and_refuses_work");
    }

    #[test]
    fn dropping_last_handle_cancels_queue() {
        init_test("dropping_last_handle_cancels_queue");
        let session = Session::new(());
        let mut queued = None;
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = session.lock();
            queued = Some(session.access(|_: &SessionGuard<'_, ()>| Ok(())));
            panic!("holder failed");
        }));
        crate::assert_with_log!(unwound.is_err(), "panicked", true, unwound.is_err());
        let locked = session.diagnostics().locked;
        crate::assert_with_log!(!locked, "released while unwinding", false, locked);
        let pending = session.pending_count();
        crate::assert_with_log!(pending == 1, "left queued", 1, pending);

        drop(session);
        let future = queued.expect("task submitted");
        let cancelled = future.is_cancelled();
        crate::assert_with_log!(cancelled, "cancelled on drop", true, cancelled);
        let result = future.get();
        let cancelled = matches!(result, Err(AccessError::Cancelled));
        crate::assert_with_log!(cancelled, "waiter woken", true, result);
        crate::test_complete!("dropping_last_handle_cancels_queue");
    }

    #[test]
    fn failures_go_to_session_handler() {
        init_test("failures_go_to_session_handler");
        let session = Session::new(());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        session.set_error_handler(Some(Arc::new(move |_: &crate::delivery::ErrorEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        let future = session.access(|_: &SessionGuard<'_, ()>| Err(CommandError::msg("bad")));
        session.ensure_access_queue_purged();
        let failed = matches!(future.get(), Err(AccessError::ExecutionFailed(_)));
        crate::assert_with_log!(failed, "failed", true, failed);
        let count = calls.load(Ordering::SeqCst);
        crate::assert_with_log!(count == 1, "delivered once", 1, count);
        crate::test_complete!("failures_go_to_session_handler");
    }

    #[test]
    fn try_purge_reports_contention() {
        init_test("try_purge_reports_contention");
        let session = Session::new(());
        let held = Arc::new(std::sync::Barrier::new(2));
        let release = Arc::new(std::sync::Barrier::new(2));
        let worker = {
            let session = session.clone();
            let held = Arc::clone(&held);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let _guard = session.lock();
                held.wait();
                release.wait();
            })
        };
        held.wait();
        let future = session.access(|_: &SessionGuard<'_, ()>| Ok(()));
        let purged = session.try_purge_access_queue();
        crate::assert_with_log!(!purged, "lock busy", false, purged);
        release.wait();
        worker.join().expect("join");
        let done = future.get();
        crate::assert_with_log!(done.is_ok(), "holder ran it", true, done);
        let purged = session.try_purge_access_queue();
        crate::assert_with_log!(purged, "empty", true, purged);
        crate::test_complete!("try_purge_reports_contention");
    }
}

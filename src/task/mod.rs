//! Commands and the pending tasks that wrap them.
//!
//! A [`Command`] is the unit of work submitted to a session. Once queued it
//! becomes a [`PendingTask`]: the command plus its result slot, its id, and
//! the interceptor chain captured at submission time. Pending tasks are only
//! ever run by the thread that holds the session lock.

mod future;

pub use future::{AccessFuture, TaskState};
pub(crate) use future::ResultSlot;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::delivery::{deliver_error, ErrorEvent, ErrorHandler};
use crate::error::CommandError;
use crate::intercept::{CommandInfo, CommandInterceptor, ExecutionContext, InterceptorChain};
use crate::session::SessionGuard;
use crate::types::TaskId;

type Action<S> = Box<dyn FnOnce(&SessionGuard<'_, S>) -> Result<(), CommandError> + Send>;

/// Work to run against a session's state while holding its lock.
///
/// The closure receives the [`SessionGuard`], which is the only way to reach
/// the state. A command may carry its own [`ErrorHandler`]; it then receives
/// the command's failures instead of the session's handler.
pub struct Command<S> {
    action: Action<S>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    name: Option<String>,
}

impl<S> Command<S> {
    /// Wraps a closure.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce(&SessionGuard<'_, S>) -> Result<(), CommandError> + Send + 'static,
    {
        Self {
            action: Box::new(action),
            error_handler: None,
            name: None,
        }
    }

    /// Routes failures of this command to `handler`.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Names the command in logs and interceptor callbacks.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the command's name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the command directly, converting a panic into an error.
    pub(crate) fn execute(self, guard: &SessionGuard<'_, S>) -> Result<(), CommandError> {
        let action = self.action;
        catch_unwind(AssertUnwindSafe(|| action(guard)))
            .unwrap_or_else(|payload| Err(CommandError::from_panic(&*payload)))
    }
}

impl<S> fmt::Debug for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("has_error_handler", &self.error_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// A queued command together with everything needed to run it later.
pub(crate) struct PendingTask<S> {
    id: TaskId,
    command: Command<S>,
    slot: Arc<ResultSlot>,
    interceptors: InterceptorChain<dyn CommandInterceptor>,
    enqueued_at: Instant,
}

impl<S> PendingTask<S> {
    /// Wraps `command` and returns the future observing it.
    pub(crate) fn new(
        command: Command<S>,
        interceptors: InterceptorChain<dyn CommandInterceptor>,
    ) -> (Self, AccessFuture) {
        let id = TaskId::next();
        let slot = Arc::new(ResultSlot::new());
        let future = AccessFuture::new(id, Arc::clone(&slot));
        let task = Self {
            id,
            command,
            slot,
            interceptors,
            enqueued_at: Instant::now(),
        };
        (task, future)
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Marks the task cancelled without running it.
    pub(crate) fn cancel(&self) -> bool {
        self.slot.cancel()
    }
}

impl<S> PendingTask<S> {
    /// Runs the task on the lock holder's thread.
    ///
    /// Cancelled tasks are skipped without touching the interceptors. For
    /// started tasks the end callback fires exactly once, after the result
    /// is recorded and any failure has been delivered.
    pub(crate) fn run(self, guard: &SessionGuard<'_, S>) {
        let Self {
            id,
            command,
            slot,
            interceptors,
            enqueued_at,
        } = self;

        if !slot.try_start() {
            tracing::trace!(task_id = %id, "skipping cancelled access task");
            return;
        }

        let session = guard.session();
        let session_id = session.id();
        let name = command.name.clone();
        let task_handler = command.error_handler.clone();
        let info = CommandInfo {
            task_id: id,
            session_id,
            name: name.as_deref(),
        };
        tracing::trace!(
            task_id = %id,
            %session_id,
            queued_for = ?enqueued_at.elapsed(),
            "running access task"
        );

        let ctx = interceptors.start(ExecutionContext::for_task(id, session_id), &info);
        match command.execute(guard) {
            Ok(()) => slot.complete(),
            Err(error) => {
                let error = Arc::new(error);
                interceptors.exception(&ctx, &info, &error);
                let handler = task_handler
                    .or_else(|| session.error_handler())
                    .unwrap_or_else(|| session.default_error_handler());
                deliver_error(
                    &*handler,
                    &ErrorEvent::new(Arc::clone(&error), session_id, Some(id)),
                );
                slot.fail(error);
            }
        }
        interceptors.end(&ctx, &info);
    }
}

impl<S> fmt::Debug for PendingTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("id", &self.id)
            .field("name", &self.command.name)
            .field("state", &self.slot.state())
            .finish_non_exhaustive()
    }
}

//! Routing of command failures to error handlers.
//!
//! When a queued command fails, the failure is offered to exactly one
//! handler, picked in this order:
//!
//! 1. the handler attached to the command itself,
//! 2. the handler configured on the session,
//! 3. the service-wide default (a [`DefaultErrorHandler`] unless replaced).
//!
//! Delivery is terminal: a handler that panics is caught and logged, and the
//! panic never reaches the draining thread.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::Level;

use crate::config::AccessConfig;
use crate::error::CommandError;
use crate::types::{SessionId, TaskId};

/// Classification names logged at DEBUG by [`DefaultErrorHandler`].
pub const DEFAULT_IGNORED_ERRORS: &[&str] = &[
    "std::io::ErrorKind::BrokenPipe",
    "std::io::ErrorKind::ConnectionAborted",
    "std::io::ErrorKind::ConnectionReset",
    "std::io::ErrorKind::TimedOut",
];

/// A failure raised by a queued command.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    error: Arc<CommandError>,
    session_id: SessionId,
    task_id: Option<TaskId>,
}

impl ErrorEvent {
    /// Creates an event for `error` raised against `session_id`.
    #[must_use]
    pub fn new(error: Arc<CommandError>, session_id: SessionId, task_id: Option<TaskId>) -> Self {
        Self {
            error,
            session_id,
            task_id,
        }
    }

    /// The failure.
    #[must_use]
    pub fn error(&self) -> &CommandError {
        &self.error
    }

    /// Session the failing command ran against.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Task that failed, if the failure came from the queue.
    #[must_use]
    pub const fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }
}

/// Receives command failures.
pub trait ErrorHandler: Send + Sync {
    /// Handles one failure.
    fn handle(&self, event: &ErrorEvent);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ErrorEvent) + Send + Sync,
{
    fn handle(&self, event: &ErrorEvent) {
        self(event);
    }
}

/// Logs failures at ERROR, demoting expected transport noise to DEBUG.
///
/// Errors whose [classification](CommandError::classification) is on the
/// ignore list are logged at DEBUG. When DEBUG logging is enabled anyway,
/// everything is logged at ERROR so nothing hides during local debugging.
#[derive(Debug, Clone)]
pub struct DefaultErrorHandler {
    ignored: BTreeSet<String>,
}

impl DefaultErrorHandler {
    /// Creates a handler with the given ignore list.
    #[must_use]
    pub fn new<I, S>(ignored: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored: ignored.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a handler using the configured ignore list.
    #[must_use]
    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(config.ignored_errors.iter().cloned())
    }

    /// Returns true if `error` is expected noise.
    #[must_use]
    pub fn is_ignored(&self, error: &CommandError) -> bool {
        self.ignored.contains(error.classification().as_ref())
    }

    /// Level used for `error` given whether DEBUG is already enabled.
    #[must_use]
    pub fn level_for(&self, error: &CommandError, debug_enabled: bool) -> Level {
        if !debug_enabled && self.is_ignored(error) {
            Level::DEBUG
        } else {
            Level::ERROR
        }
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_ERRORS.iter().copied())
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, event: &ErrorEvent) {
        let error = event.error();
        let session_id = event.session_id();
        let task_id = event.task_id();
        if self.level_for(error, tracing::enabled!(Level::DEBUG)) == Level::DEBUG {
            tracing::debug!(
                %session_id,
                ?task_id,
                kind = %error.classification(),
                error = %error,
                "ignored expected error"
            );
        } else {
            tracing::error!(
                %session_id,
                ?task_id,
                kind = %error.classification(),
                error = %error,
                "unhandled error in access task"
            );
        }
    }
}

/// Delivers `event` to `handler`, containing any panic it raises.
pub fn deliver_error(handler: &dyn ErrorHandler, event: &ErrorEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
        tracing::error!(
            session_id = %event.session_id(),
            original = %event.error(),
            "error handler panicked while handling an access task failure"
        );
    }
}

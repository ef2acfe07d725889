//! Error types for session access.
//!
//! Error handling follows these principles:
//!
//! - Programming errors (unlocking without holding, waiting on a future while
//!   holding a session lock) surface as [`AccessError::IllegalState`] and are
//!   never retried
//! - Failures of user commands are captured as [`CommandError`] values,
//!   delivered to an error handler and preserved for whoever waits on the
//!   task's future
//! - Panics inside commands are converted to [`CommandError`]s so that one
//!   bad command never takes the draining thread down
//!
//! # Error Categories
//!
//! - **Illegal state**: lock discipline violations
//! - **Execution**: the command itself failed
//! - **Cancellation**: the task was cancelled before it produced a result
//! - **Timeout**: a bounded wait elapsed
//! - **Closed**: the session was closed

use core::fmt;
use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by session access operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    /// A lock-discipline violation (programming error).
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The queued or synchronous command failed.
    #[error("access task failed: {0}")]
    ExecutionFailed(Arc<CommandError>),
    /// The task was cancelled before a result was delivered.
    #[error("access task was cancelled")]
    Cancelled,
    /// A bounded wait elapsed before the task finished.
    #[error("timed out after {0:?} waiting for access task")]
    Timeout(Duration),
    /// The session was closed.
    #[error("session is closed")]
    SessionClosed,
}

impl AccessError {
    /// Creates an illegal-state error.
    #[must_use]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Returns the command failure that caused this error, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&CommandError> {
        match self {
            Self::ExecutionFailed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Returns true for lock-discipline violations.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}

/// A type-erased failure raised by a user command.
///
/// Any `std::error::Error + Send + Sync + 'static` converts into a
/// `CommandError` through `?`. The concrete type name is recorded at
/// conversion time and used to classify "expected" transport noise.
pub struct CommandError {
    type_name: &'static str,
    inner: Box<dyn StdError + Send + Sync + 'static>,
}

impl CommandError {
    /// Creates an error from a plain message.
    #[must_use]
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            type_name: std::any::type_name::<MessageError>(),
            inner: Box::new(MessageError(message.to_string())),
        }
    }

    /// Converts a panic payload into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self {
            type_name: std::any::type_name::<PanicError>(),
            inner: Box::new(PanicError(message)),
        }
    }

    /// Returns the concrete type name of the wrapped error.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the name used to match against ignore lists.
    ///
    /// I/O errors are classified by kind (`std::io::ErrorKind::BrokenPipe`),
    /// everything else by concrete type name.
    #[must_use]
    pub fn classification(&self) -> Cow<'static, str> {
        match self.inner.downcast_ref::<std::io::Error>() {
            Some(io) => Cow::Owned(format!("std::io::ErrorKind::{:?}", io.kind())),
            None => Cow::Borrowed(self.type_name),
        }
    }

    /// Returns true if this error was produced by a panicking command.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.inner.is::<PanicError>()
    }

    /// Attempts to downcast to the wrapped concrete error.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// Returns the wrapped error as a trait object.
    #[must_use]
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl<E> From<E> for CommandError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            type_name: std::any::type_name::<E>(),
            inner: Box::new(err),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandError")
            .field("type_name", &self.type_name)
            .field("inner", &self.inner)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MessageError(String);

#[derive(Debug, thiserror::Error)]
#[error("command panicked: {0}")]
struct PanicError(String);

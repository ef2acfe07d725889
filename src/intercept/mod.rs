//! Interceptors observing command and request execution.
//!
//! Interceptors follow an explicit three-phase protocol. The start callback
//! receives an [`ExecutionContext`] by value and returns the (possibly
//! enriched) context, which is then handed to the next interceptor and
//! finally to the exception and end callbacks. Nothing is shared behind the
//! caller's back: what a start callback wants to correlate with the end
//! callback travels inside the context.
//!
//! ```text
//! start(ctx0) -> ctx1 -> start(ctx1) -> ctx2 ...
//!     command runs
//!     [handle_exception(&ctxN, err)]   only on failure
//!     end(&ctxN)                       always, exactly once
//! ```
//!
//! Chains are frozen when the owning service is built and are captured by
//! each task at submission time, so the order seen by one task never changes
//! while it is queued or running.

mod context;

pub use context::ExecutionContext;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::CommandError;
use crate::service::Request;
use crate::types::{SessionId, TaskId};

/// Description of the command being executed, passed to interceptors.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo<'a> {
    /// Task being executed.
    pub task_id: TaskId,
    /// Session the task runs against.
    pub session_id: SessionId,
    /// Optional human-readable name of the command.
    pub name: Option<&'a str>,
}

/// Observer wrapped around every queued task.
pub trait CommandInterceptor: Send + Sync {
    /// Called before the command runs; returns the context for later phases.
    fn command_execution_start(
        &self,
        ctx: ExecutionContext,
        _command: &CommandInfo<'_>,
    ) -> ExecutionContext {
        ctx
    }

    /// Called when the command fails, before error delivery.
    fn handle_exception(
        &self,
        _ctx: &ExecutionContext,
        _command: &CommandInfo<'_>,
        _error: &CommandError,
    ) {
    }

    /// Called once after the command, whether it succeeded or not.
    fn command_execution_end(&self, _ctx: &ExecutionContext, _command: &CommandInfo<'_>) {}
}

/// Observer wrapped around inbound request handling.
pub trait RequestInterceptor: Send + Sync {
    /// Called before the request is handled.
    fn request_start(&self, ctx: ExecutionContext, _request: &Request) -> ExecutionContext {
        ctx
    }

    /// Called when the request handler fails.
    fn handle_exception(
        &self,
        _ctx: &ExecutionContext,
        _request: &Request,
        _error: &CommandError,
    ) {
    }

    /// Called once after the request, whether it succeeded or not.
    fn request_end(&self, _ctx: &ExecutionContext, _request: &Request) {}
}

/// Immutable, cheaply clonable ordered list of interceptors.
pub struct InterceptorChain<I: ?Sized> {
    interceptors: Arc<[Arc<I>]>,
}

impl<I: ?Sized> InterceptorChain<I> {
    /// Freezes the given interceptors into a chain.
    #[must_use]
    pub fn new(interceptors: Vec<Arc<I>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// Returns the number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Returns true if the chain has no interceptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    fn each(&self, phase: &'static str, mut f: impl FnMut(&I)) {
        for interceptor in self.interceptors.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(&**interceptor))).is_err() {
                tracing::error!(phase, "interceptor panicked; continuing with the next one");
            }
        }
    }

    fn fold(
        &self,
        phase: &'static str,
        ctx: ExecutionContext,
        f: impl Fn(&I, ExecutionContext) -> ExecutionContext,
    ) -> ExecutionContext {
        let mut ctx = ctx;
        for interceptor in self.interceptors.iter() {
            let input = ctx.clone();
            match catch_unwind(AssertUnwindSafe(|| f(&**interceptor, input))) {
                Ok(next) => ctx = next,
                Err(_) => {
                    tracing::error!(phase, "interceptor panicked; keeping previous context");
                }
            }
        }
        ctx
    }
}

impl InterceptorChain<dyn CommandInterceptor> {
    pub(crate) fn start(&self, ctx: ExecutionContext, info: &CommandInfo<'_>) -> ExecutionContext {
        self.fold("command_execution_start", ctx, |i, ctx| {
            i.command_execution_start(ctx, info)
        })
    }

    pub(crate) fn exception(
        &self,
        ctx: &ExecutionContext,
        info: &CommandInfo<'_>,
        err: &CommandError,
    ) {
        self.each("handle_exception", |i| i.handle_exception(ctx, info, err));
    }

    pub(crate) fn end(&self, ctx: &ExecutionContext, info: &CommandInfo<'_>) {
        self.each("command_execution_end", |i| i.command_execution_end(ctx, info));
    }
}

impl InterceptorChain<dyn RequestInterceptor> {
    pub(crate) fn start(&self, ctx: ExecutionContext, request: &Request) -> ExecutionContext {
        self.fold("request_start", ctx, |i, ctx| i.request_start(ctx, request))
    }

    pub(crate) fn exception(&self, ctx: &ExecutionContext, request: &Request, err: &CommandError) {
        self.each("handle_exception", |i| i.handle_exception(ctx, request, err));
    }

    pub(crate) fn end(&self, ctx: &ExecutionContext, request: &Request) {
        self.each("request_end", |i| i.request_end(ctx, request));
    }
}

impl<I: ?Sized> Clone for InterceptorChain<I> {
    fn clone(&self) -> Self {
        Self {
            interceptors: Arc::clone(&self.interceptors),
        }
    }
}

impl<I: ?Sized> Default for InterceptorChain<I> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<I: ?Sized> std::fmt::Debug for InterceptorChain<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

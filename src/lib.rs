//! Exclusive, queued access to per-session state.
//!
//! Each [`Session`] guards a value behind a re-entrant lock. Threads that
//! hold the lock work with the value directly through a [`SessionGuard`].
//! Threads that do not can either wait for the lock
//! ([`Session::access_synchronously`]) or hand the work to the queue
//! ([`Session::access`]) and let whoever holds the lock run it on release.
//!
//! # Modules
//!
//! - [`sync`]: the re-entrant lock and the per-thread held-lock registry
//! - [`session`]: sessions, guards, the access queue and lock checks
//! - [`task`]: commands, task states and [`AccessFuture`]
//! - [`intercept`]: interceptors around commands and requests
//! - [`delivery`]: routing of command failures to error handlers
//! - [`service`]: the session registry and request handling
//! - [`config`]: configuration, profiles and layered loading
//!
//! # Example
//!
//! ```
//! use session_access::{Session, SessionGuard};
//!
//! let session = Session::new(0_u64);
//! let guard = session.lock();
//! let future = session.access(|guard: &SessionGuard<'_, u64>| {
//!     *guard.state_mut() += 1;
//!     Ok(())
//! });
//! assert!(!future.is_done());
//! drop(guard); // runs the queued task before releasing the lock
//! assert!(future.get().is_ok());
//! assert_eq!(*session.lock().state(), 1);
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod intercept;
pub mod service;
pub mod session;
pub mod sync;
pub mod task;
pub mod test_utils;
pub mod types;

#[doc(hidden)]
pub use tracing as __tracing;

pub use config::{AccessConfig, AccessProfile, ConfigError, ConfigLoader};
pub use delivery::{DefaultErrorHandler, ErrorEvent, ErrorHandler};
pub use error::{AccessError, CommandError};
pub use intercept::{
    CommandInfo, CommandInterceptor, ExecutionContext, InterceptorChain, RequestInterceptor,
};
pub use service::{Request, Service, ServiceBuilder};
pub use session::lock_check::{LockCheck, LockCheckStrategy};
pub use session::{LockDiagnostics, Session, SessionGuard};
pub use task::{AccessFuture, Command, TaskState};
pub use types::{RequestId, SessionId, TaskId};

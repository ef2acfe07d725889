//! The service: owner of sessions and of everything they share.
//!
//! A [`Service`] is built once with [`ServiceBuilder`]. Interceptor chains,
//! the default error handler and the configuration are frozen at build time
//! and shared by every session the service creates.
//!
//! ```
//! use session_access::{Request, ServiceBuilder};
//!
//! let service = ServiceBuilder::new().build::<Vec<String>>().unwrap();
//! let request = Request::new("alice", "/hello");
//! let len = service
//!     .handle_request(&request, |guard| {
//!         guard.state_mut().push(request.path().to_string());
//!         Ok(guard.state().len())
//!     })
//!     .unwrap();
//! assert_eq!(len, 1);
//! ```

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::{AccessConfig, ConfigError};
use crate::delivery::{deliver_error, DefaultErrorHandler, ErrorEvent, ErrorHandler};
use crate::error::{AccessError, CommandError};
use crate::intercept::{
    CommandInterceptor, ExecutionContext, InterceptorChain, RequestInterceptor,
};
use crate::session::lock_check::LockCheck;
use crate::session::{LockDiagnostics, Session, SessionGuard};
use crate::sync::held;
use crate::types::RequestId;

/// Service-wide collaborators shared by all sessions of a service.
pub(crate) struct ServiceContext {
    pub(crate) config: AccessConfig,
    pub(crate) lock_check: LockCheck,
    pub(crate) command_interceptors: InterceptorChain<dyn CommandInterceptor>,
    pub(crate) request_interceptors: InterceptorChain<dyn RequestInterceptor>,
    pub(crate) default_error_handler: Arc<dyn ErrorHandler>,
}

impl ServiceContext {
    pub(crate) fn from_config(config: AccessConfig) -> Self {
        Self {
            lock_check: config.lock_check(),
            default_error_handler: Arc::new(DefaultErrorHandler::from_config(&config)),
            command_interceptors: InterceptorChain::default(),
            request_interceptors: InterceptorChain::default(),
            config,
        }
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::from_config(AccessConfig::default())
    }
}

/// An inbound request addressed to one session.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    session_key: String,
    path: String,
    attributes: BTreeMap<String, String>,
}

impl Request {
    /// Creates a request for the session stored under `session_key`.
    #[must_use]
    pub fn new(session_key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            session_key: session_key.into(),
            path: path.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Unique id of the request.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Key of the target session.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Request path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Looks up an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Builder for [`Service`].
#[derive(Default)]
pub struct ServiceBuilder {
    config: Option<AccessConfig>,
    command_interceptors: Vec<Arc<dyn CommandInterceptor>>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    default_error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ServiceBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Appends a command interceptor. Interceptors run in insertion order.
    #[must_use]
    pub fn command_interceptor(mut self, interceptor: impl CommandInterceptor + 'static) -> Self {
        self.command_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends a shared command interceptor.
    #[must_use]
    pub fn shared_command_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.command_interceptors.push(interceptor);
        self
    }

    /// Appends a request interceptor. Interceptors run in insertion order.
    #[must_use]
    pub fn request_interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.request_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends a shared request interceptor.
    #[must_use]
    pub fn shared_request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    /// Replaces the [`DefaultErrorHandler`] as the last-resort handler.
    #[must_use]
    pub fn default_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.default_error_handler = Some(Arc::new(handler));
        self
    }

    /// Validates the configuration and freezes everything into a service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn build<S>(self) -> Result<Service<S>, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let mut context = ServiceContext::from_config(config);
        context.command_interceptors = InterceptorChain::new(self.command_interceptors);
        context.request_interceptors = InterceptorChain::new(self.request_interceptors);
        if let Some(handler) = self.default_error_handler {
            context.default_error_handler = handler;
        }
        tracing::debug!(
            lock_check = context.config.lock_check.name(),
            command_interceptors = context.command_interceptors.len(),
            request_interceptors = context.request_interceptors.len(),
            "service built"
        );
        Ok(Service {
            context: Arc::new(context),
            sessions: RwLock::new(HashMap::new()),
        })
    }
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("config", &self.config)
            .field("command_interceptors", &self.command_interceptors.len())
            .field("request_interceptors", &self.request_interceptors.len())
            .finish_non_exhaustive()
    }
}

/// Owner of a set of sessions keyed by string.
pub struct Service<S> {
    context: Arc<ServiceContext>,
    sessions: RwLock<HashMap<String, Session<S>>>,
}

impl<S> Service<S> {
    /// The configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &AccessConfig {
        &self.context.config
    }

    /// Looks up an existing session.
    #[must_use]
    pub fn session(&self, key: &str) -> Option<Session<S>> {
        self.sessions.read().get(key).cloned()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Removes and closes a session. Returns false if there was none.
    pub fn close_session(&self, key: &str) -> bool {
        let removed = self.sessions.write().remove(key);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Diagnostics of every session whose lock is held longer than the
    /// configured threshold. Empty when no threshold is configured.
    #[must_use]
    pub fn sessions_with_stale_locks(&self) -> Vec<LockDiagnostics> {
        let Some(threshold) = self.context.config.stale_lock_threshold() else {
            return Vec::new();
        };
        let stale: Vec<_> = self
            .sessions
            .read()
            .values()
            .map(Session::diagnostics)
            .filter(|diagnostics| diagnostics.held_longer_than(threshold))
            .collect();
        for diagnostics in &stale {
            tracing::warn!(
                session_id = %diagnostics.session_id,
                held_for = ?diagnostics.held_for,
                pending = diagnostics.pending,
                "session lock held longer than threshold"
            );
        }
        stale
    }
}

impl<S: Default> Service<S> {
    /// Returns the session stored under `key`, creating it on first use.
    pub fn get_or_create_session(&self, key: &str) -> Session<S> {
        if let Some(session) = self.session(key) {
            return session;
        }
        self.sessions
            .write()
            .entry(key.to_string())
            .or_insert_with(|| {
                Session::with_context(
                    S::default(),
                    Some(key.to_string()),
                    Arc::clone(&self.context),
                )
            })
            .clone()
    }

    /// Handles `request` against its session.
    ///
    /// Request interceptors wrap the whole call. The session lock is held
    /// while `handler` runs; releasing it afterwards runs any tasks queued
    /// meanwhile. A failing or panicking handler is reported to the request
    /// interceptors and the session's error handler, then returned.
    ///
    /// # Errors
    ///
    /// - [`AccessError::IllegalState`] if the current thread holds the lock
    ///   of a different session.
    /// - [`AccessError::ExecutionFailed`] if the handler fails.
    pub fn handle_request<R, F>(&self, request: &Request, handler: F) -> Result<R, AccessError>
    where
        F: FnOnce(&SessionGuard<'_, S>) -> Result<R, CommandError>,
    {
        let session = self.get_or_create_session(request.session_key());
        if !session.has_lock() && held::holds_other_session_lock(session.id()) {
            return Err(AccessError::illegal_state(format!(
                "cannot handle {} for {} while holding another session lock",
                request.id(),
                session.id()
            )));
        }

        let chain = &self.context.request_interceptors;
        let ctx = chain.start(
            ExecutionContext::for_request(request.id(), Some(session.id())),
            request,
        );
        tracing::trace!(
            request_id = %request.id(),
            session_id = %session.id(),
            path = request.path(),
            "handling request"
        );

        let outcome = {
            let guard = session.lock();
            catch_unwind(AssertUnwindSafe(|| handler(&guard)))
                .unwrap_or_else(|payload| Err(CommandError::from_panic(&*payload)))
        };

        let result = match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                let error = Arc::new(error);
                chain.exception(&ctx, request, &error);
                let handler = session
                    .error_handler()
                    .unwrap_or_else(|| Arc::clone(&self.context.default_error_handler));
                deliver_error(
                    &*handler,
                    &ErrorEvent::new(Arc::clone(&error), session.id(), None),
                );
                Err(AccessError::ExecutionFailed(error))
            }
        };
        chain.end(&ctx, request);
        result
    }
}

impl<S> std::fmt::Debug for Service<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.context.config)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

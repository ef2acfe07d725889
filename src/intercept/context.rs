//! Per-execution context threaded through interceptor phases.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{RequestId, SessionId, TaskId};

/// Values one execution carries from its start phase to its end phase.
///
/// A fresh context is created for every task or request and dropped once
/// the end phase has run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: Option<TaskId>,
    request_id: Option<RequestId>,
    session_id: Option<SessionId>,
    started_at: Instant,
    values: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Creates the context for one queued task.
    #[must_use]
    pub fn for_task(task_id: TaskId, session_id: SessionId) -> Self {
        Self {
            task_id: Some(task_id),
            request_id: None,
            session_id: Some(session_id),
            started_at: Instant::now(),
            values: BTreeMap::new(),
        }
    }

    /// Creates the context for one inbound request.
    #[must_use]
    pub fn for_request(request_id: RequestId, session_id: Option<SessionId>) -> Self {
        Self {
            task_id: None,
            request_id: Some(request_id),
            session_id,
            started_at: Instant::now(),
            values: BTreeMap::new(),
        }
    }

    /// Returns the context with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no values are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the stored values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Task this context belongs to, if any.
    #[must_use]
    pub const fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Request this context belongs to, if any.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Session the execution runs against, if known.
    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

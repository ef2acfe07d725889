//! Core types shared across the crate.
//!
//! - [`id`]: Identifier types (`SessionId`, `TaskId`, `RequestId`)

pub mod id;

pub use id::{RequestId, SessionId, TaskId};

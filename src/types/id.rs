//! Identifier types.
//!
//! Identifiers are process-unique and allocated from monotonic counters, so
//! they order by creation and never repeat within one process.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocates the next identifier.
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Creates an identifier from a raw value (testing only).
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw numeric value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies one session-equivalent (one access queue).
    SessionId,
    NEXT_SESSION_ID,
    "session"
);

define_id!(
    /// Identifies one queued access task.
    TaskId,
    NEXT_TASK_ID,
    "task"
);

define_id!(
    /// Identifies one inbound request.
    RequestId,
    NEXT_REQUEST_ID,
    "request"
);

//! Test helpers shared by unit and integration tests.
//!
//! Tests call [`init_test_logging`] first, mark progress with
//! [`test_phase!`](crate::test_phase) / [`test_section!`](crate::test_section),
//! check with [`assert_with_log!`](crate::assert_with_log) and finish with
//! [`test_complete!`](crate::test_complete). Output goes through the test
//! writer so it only shows for failing tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG`; defaults to `session_access=debug`. Safe to call from
/// every test.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("session_access=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::__tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks a section inside a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::__tracing::info!(section = $name, "--- section ---");
    };
}

/// Marks successful completion of a test, with optional summary fields.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::__tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
    ($name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::__tracing::info!(test = $name, $($key = ?$value),+, "=== TEST COMPLETE ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            $crate::__tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

//! Shared helpers for integration tests.

#![allow(dead_code)]

use proptest::test_runner::Config as ProptestConfig;

/// Installs the crate's test subscriber.
pub fn init_test_logging() {
    session_access::test_utils::init_test_logging();
}

/// Proptest configuration used by the property suites.
///
/// `PROPTEST_CASES` overrides the case count.
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(cases);
    ProptestConfig {
        cases,
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

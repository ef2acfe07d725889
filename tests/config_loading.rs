//! Layered configuration loading: profile, file, environment, overrides.

mod common;

use std::io::Write as _;

use common::init_test_logging;
use session_access::{
    assert_with_log, test_complete, test_phase, AccessProfile, ConfigError, ConfigLoader,
    LockCheckStrategy, ServiceBuilder,
};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn file_values_override_profile() {
    init_test("file_values_override_profile");
    let file = config_file(
        "# production box\nlock_check = log\ncapture_backtrace = true\neager_purge = 1\n",
    );
    let config = ConfigLoader::new()
        .env(false)
        .profile(AccessProfile::Production)
        .file(file.path())
        .load()
        .expect("valid file");
    assert_with_log!(
        config.lock_check == LockCheckStrategy::Log,
        "strategy from file",
        LockCheckStrategy::Log,
        config.lock_check
    );
    assert_with_log!(config.capture_backtrace, "backtrace", true, config.capture_backtrace);
    assert_with_log!(config.eager_purge, "eager", true, config.eager_purge);
    test_complete!("file_values_override_profile");
}

#[test]
fn overrides_beat_file() {
    init_test("overrides_beat_file");
    let file = config_file("lock_check = log\n");
    let config = ConfigLoader::new()
        .env(false)
        .file(file.path())
        .override_value("lock_check", "throw")
        .load()
        .expect("valid config");
    assert_with_log!(
        config.lock_check == LockCheckStrategy::Throw,
        "override wins",
        LockCheckStrategy::Throw,
        config.lock_check
    );
    test_complete!("overrides_beat_file");
}

#[test]
fn environment_is_read_with_prefix() {
    init_test("environment_is_read_with_prefix");
    std::env::set_var("SESSION_ACCESS_STALE_LOCK_THRESHOLD_MS", "1234");
    let loaded = ConfigLoader::new().load();
    std::env::remove_var("SESSION_ACCESS_STALE_LOCK_THRESHOLD_MS");
    let config = loaded.expect("valid env");
    assert_with_log!(
        config.stale_lock_threshold_ms == 1234,
        "env value",
        1234,
        config.stale_lock_threshold_ms
    );
    test_complete!("environment_is_read_with_prefix");
}

#[test]
fn missing_file_and_bad_values_are_errors() {
    init_test("missing_file_and_bad_values_are_errors");
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = ConfigLoader::new()
        .env(false)
        .file(dir.path().join("absent.conf"))
        .load();
    let io = matches!(missing, Err(ConfigError::Io(_)));
    assert_with_log!(io, "io error", true, missing);

    let file = config_file("lock_check = sometimes\n");
    let bad = ConfigLoader::new().env(false).file(file.path()).load();
    let parse = matches!(bad, Err(ConfigError::Parse(_)));
    assert_with_log!(parse, "parse error", true, bad);
    test_complete!("missing_file_and_bad_values_are_errors");
}

#[test]
fn loaded_config_drives_the_service() {
    init_test("loaded_config_drives_the_service");
    let config = ConfigLoader::new()
        .env(false)
        .profile(AccessProfile::Development)
        .load()
        .expect("valid profile");
    let service = ServiceBuilder::new()
        .config(config)
        .build::<()>()
        .expect("valid config");
    let session = service.get_or_create_session("dev");
    let result = session.run_pending_access_tasks();
    let illegal = result.as_ref().is_err_and(session_access::AccessError::is_illegal_state);
    assert_with_log!(illegal, "development profile throws", true, result);
    let checked = session.check_has_lock("state read without lock");
    assert_with_log!(checked.is_err(), "check_has_lock throws", true, checked);
    let guard = session.lock();
    let checked = session.check_has_lock("state read with lock");
    assert_with_log!(checked.is_ok(), "holder passes", true, checked);
    drop(guard);
    test_complete!("loaded_config_drives_the_service");
}

//! Configuration and profiles for session access.
//!
//! This module provides:
//! - [`AccessConfig`], the settings a [`Service`](crate::service::Service)
//!   hands to every session it creates
//! - [`AccessProfile`] presets for development and production
//! - Validation of the settings
//! - Layered loading (profile + file + env + overrides)
//!
//! Note: file parsing is intentionally minimal: flat `key = value` lines,
//! `#` comments, optional double quotes around values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::DEFAULT_IGNORED_ERRORS;
use crate::session::lock_check::{LockCheck, LockCheckStrategy};

/// Prefix of environment variables read by [`ConfigLoader`].
pub const ENV_PREFIX: &str = "SESSION_ACCESS_";

/// Settings shared by all sessions of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// What happens when code that needs the session lock runs without it.
    pub lock_check: LockCheckStrategy,
    /// Attach a backtrace to lock-check warnings (LOG strategy only).
    pub capture_backtrace: bool,
    /// Let `access` drain the queue on the spot when the lock is free.
    pub eager_purge: bool,
    /// Error classifications the default handler logs at DEBUG.
    pub ignored_errors: Vec<String>,
    /// A lock held longer than this is reported as stale. Zero disables.
    pub stale_lock_threshold_ms: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            lock_check: LockCheckStrategy::default(),
            capture_backtrace: false,
            eager_purge: false,
            ignored_errors: DEFAULT_IGNORED_ERRORS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            stale_lock_threshold_ms: 0,
        }
    }
}

impl AccessConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_backtrace && self.lock_check != LockCheckStrategy::Log {
            return Err(ConfigError::BacktraceRequiresLog(self.lock_check));
        }
        if let Some(blank) = self.ignored_errors.iter().find(|name| name.trim().is_empty()) {
            return Err(ConfigError::InvalidIgnoredError(blank.clone()));
        }
        Ok(())
    }

    /// The lock check described by this configuration.
    #[must_use]
    pub fn lock_check(&self) -> LockCheck {
        LockCheck::new(self.lock_check).with_backtrace(self.capture_backtrace)
    }

    /// The stale-lock threshold, or `None` when disabled.
    #[must_use]
    pub fn stale_lock_threshold(&self) -> Option<Duration> {
        (self.stale_lock_threshold_ms > 0)
            .then(|| Duration::from_millis(self.stale_lock_threshold_ms))
    }

    /// Sets the lock check strategy.
    #[must_use]
    pub fn with_lock_check(mut self, strategy: LockCheckStrategy) -> Self {
        self.lock_check = strategy;
        self
    }

    /// Enables or disables eager purging in `access`.
    #[must_use]
    pub fn with_eager_purge(mut self, eager: bool) -> Self {
        self.eager_purge = eager;
        self
    }
}

/// Deployment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessProfile {
    /// Lock misuse fails loudly with an error.
    Development,
    /// Lock misuse is only asserted in debug builds.
    #[default]
    Production,
}

impl AccessProfile {
    /// Expands the profile into a configuration.
    #[must_use]
    pub fn to_config(self) -> AccessConfig {
        match self {
            Self::Development => AccessConfig {
                lock_check: LockCheckStrategy::Throw,
                stale_lock_threshold_ms: 10_000,
                ..AccessConfig::default()
            },
            Self::Production => AccessConfig {
                lock_check: LockCheckStrategy::Assert,
                ..AccessConfig::default()
            },
        }
    }
}

/// Configuration loader with layered sources.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    profile: AccessProfile,
    file_path: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
    read_env: bool,
}

impl ConfigLoader {
    /// Creates a loader with the production profile that reads the
    /// environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            profile: AccessProfile::Production,
            file_path: None,
            overrides: BTreeMap::new(),
            read_env: true,
        }
    }

    /// Sets the base profile.
    #[must_use]
    pub fn profile(mut self, profile: AccessProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Sets a file path for config loading.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Enables or disables `SESSION_ACCESS_*` environment variables.
    #[must_use]
    pub fn env(mut self, read_env: bool) -> Self {
        self.read_env = read_env;
        self
    }

    /// Adds a programmatic override (highest precedence).
    ///
    /// Keys use the file spelling (`lock_check`) or the environment spelling
    /// (`SESSION_ACCESS_LOCK_CHECK`).
    #[must_use]
    pub fn override_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Loads configuration with precedence:
    /// 1. Profile defaults (lowest)
    /// 2. File config
    /// 3. Environment variables
    /// 4. Programmatic overrides (highest)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, a value does not
    /// parse, or the result fails validation.
    pub fn load(&self) -> Result<AccessConfig, ConfigError> {
        let mut config = self.profile.to_config();
        if let Some(path) = &self.file_path {
            load_from_file(&mut config, path)?;
        }
        if self.read_env {
            apply_env_overrides(&mut config)?;
        }
        for (key, value) in &self.overrides {
            apply_kv(&mut config, normalize_key(key), value)?;
        }
        config.validate()?;
        tracing::debug!(
            profile = ?self.profile,
            lock_check = config.lock_check.name(),
            "loaded access config"
        );
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error while reading configuration.
    Io(std::io::Error),
    /// Parse error.
    Parse(String),
    /// Unknown configuration key.
    UnknownKey(String),
    /// A backtrace was requested for a strategy that never logs.
    BacktraceRequiresLog(LockCheckStrategy),
    /// An empty entry in the ignored error list.
    InvalidIgnoredError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "config I/O error: {err}"),
            Self::Parse(err) => write!(f, "config parse error: {err}"),
            Self::UnknownKey(key) => write!(f, "unknown config key: {key}"),
            Self::BacktraceRequiresLog(strategy) => write!(
                f,
                "capture_backtrace requires lock_check = log, got {}",
                strategy.name()
            ),
            Self::InvalidIgnoredError(name) => write!(f, "invalid ignored error name: {name:?}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

fn load_from_file(config: &mut AccessConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(config, &contents)
}

fn apply_env_overrides(config: &mut AccessConfig) -> Result<(), ConfigError> {
    let overrides: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect();
    for (key, value) in &overrides {
        apply_kv(config, normalize_key(key), value)?;
    }
    Ok(())
}

fn normalize_key(key: &str) -> String {
    key.strip_prefix(ENV_PREFIX).unwrap_or(key).to_ascii_lowercase()
}

fn parse_config(config: &mut AccessConfig, contents: &str) -> Result<(), ConfigError> {
    for (line_idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::Parse(format!("line {}: {}", line_idx + 1, line)))?;
        apply_kv(config, key.trim().to_ascii_lowercase(), value.trim().trim_matches('"'))?;
    }
    Ok(())
}

fn apply_kv(config: &mut AccessConfig, key: String, value: &str) -> Result<(), ConfigError> {
    match key.as_str() {
        "lock_check" => {
            config.lock_check = value.parse().map_err(ConfigError::Parse)?;
        }
        "capture_backtrace" => config.capture_backtrace = parse_bool(value, &key)?,
        "eager_purge" => config.eager_purge = parse_bool(value, &key)?,
        "ignored_errors" => {
            config.ignored_errors = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        "stale_lock_threshold_ms" => {
            config.stale_lock_threshold_ms = value
                .parse()
                .map_err(|_| ConfigError::Parse(format!("invalid u64 for {key}: {value}")))?;
        }
        _ => return Err(ConfigError::UnknownKey(key)),
    }
    Ok(())
}

fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Parse(format!("invalid bool for {key}: {value}"))),
    }
}

//! Verification of the "caller holds the session lock" precondition.
//!
//! Code paths that assume the lock is already held call
//! [`LockCheck::check`]. The configured strategy decides what a violation
//! costs: nothing outside debug builds ([`Assert`]), a warning
//! ([`Log`]), or an immediate error ([`Throw`]). A check never acquires the
//! lock.
//!
//! [`Assert`]: LockCheckStrategy::Assert
//! [`Log`]: LockCheckStrategy::Log
//! [`Throw`]: LockCheckStrategy::Throw

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::str::FromStr;

use crate::error::AccessError;

/// Policy applied when a lock precondition does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockCheckStrategy {
    /// `debug_assert!`: panics in debug builds, free in release builds.
    #[default]
    Assert,
    /// Logs a warning and carries on.
    Log,
    /// Fails with [`AccessError::IllegalState`].
    Throw,
}

impl LockCheckStrategy {
    /// Returns the lowercase name of the strategy.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Assert => "assert",
            Self::Log => "log",
            Self::Throw => "throw",
        }
    }
}

impl FromStr for LockCheckStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assert" => Ok(Self::Assert),
            "log" | "warn" => Ok(Self::Log),
            "throw" | "error" => Ok(Self::Throw),
            other => Err(format!("unknown lock check strategy: {other}")),
        }
    }
}

/// A strategy plus its LOG-mode options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockCheck {
    strategy: LockCheckStrategy,
    capture_backtrace: bool,
}

impl LockCheck {
    /// Creates a check with the given strategy.
    #[must_use]
    pub const fn new(strategy: LockCheckStrategy) -> Self {
        Self {
            strategy,
            capture_backtrace: false,
        }
    }

    /// Attaches a captured backtrace to LOG diagnostics.
    #[must_use]
    pub const fn with_backtrace(mut self, capture: bool) -> Self {
        self.capture_backtrace = capture;
        self
    }

    /// The configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> LockCheckStrategy {
        self.strategy
    }

    /// Applies the strategy to an observed lock state.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::IllegalState`] when `held` is false and the
    /// strategy is [`LockCheckStrategy::Throw`].
    ///
    /// # Panics
    ///
    /// With [`LockCheckStrategy::Assert`] in builds with debug assertions.
    pub fn check(&self, held: bool, message: &str) -> Result<(), AccessError> {
        match self.strategy {
            LockCheckStrategy::Assert => {
                debug_assert!(held, "{message}");
                Ok(())
            }
            LockCheckStrategy::Log => {
                if !held {
                    if self.capture_backtrace {
                        let backtrace = Backtrace::force_capture();
                        tracing::warn!(%backtrace, "{message}");
                    } else {
                        tracing::warn!("{message}");
                    }
                }
                Ok(())
            }
            LockCheckStrategy::Throw if held => Ok(()),
            LockCheckStrategy::Throw => Err(AccessError::illegal_state(message)),
        }
    }
}

//! Error types for the jailcall runtime.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Unified error type covering configuration, execution, timeout, and
/// circuit-breaker outcomes.
///
/// Variants are intentionally coarse-grained so that callers can match on
/// error *category* (domain failure vs policy rejection) rather than on
/// command-specific details.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Invalid or missing configuration (bad command key, non-positive
    /// timeout, etc.). Only ever produced during setup, never mid-flight.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The command body failed. Carries the user-supplied failure message.
    #[error("Command failed: {0}")]
    User(String),

    /// The call exceeded `MsgConfig::call_timeout`.
    #[error("Call timed out after {after:?}")]
    Timeout {
        /// The configured deadline that was exceeded.
        after: Duration,
    },

    /// The circuit breaker is open (or the HALF-OPEN probe slot was busy)
    /// and the call was rejected without running the command body.
    #[error("Circuit breaker open; retry after {remaining:?}")]
    BreakerOpen {
        /// Time remaining until the breaker is eligible to move to
        /// HALF-OPEN, or `Duration::ZERO` when rejected by a busy probe.
        remaining: Duration,
    },
}

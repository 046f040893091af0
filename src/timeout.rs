//! Timeout wrapper (C2): races a command's work against a deadline.
//!
//! Grounded directly in the teacher's own idiom — `reliability.rs` wraps
//! every provider call with `tokio::time::timeout(timeout, fut).await`,
//! mapping `Err(Elapsed)` to a timeout error. This module factors that
//! three-line pattern (duplicated per model kind in the teacher) into one
//! reusable helper. `tokio::time::timeout`'s internal `select!` already
//! resolves the race exactly once and drops the losing future, so no
//! manual compare-and-swap completion flag is needed.

use crate::error::RuntimeError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Outcome of racing a future against `deadline`, paired with how long the
/// race took to resolve (used to record latency in the stats aggregator
/// regardless of which side won).
pub struct TimedResult<T> {
    pub result: Result<T, RuntimeError>,
    pub elapsed: Duration,
}

/// Run `fut` to completion, or report [`RuntimeError::Timeout`] if
/// `deadline` elapses first. `Duration::ZERO` disables the timeout: `fut`
/// is awaited unchanged, matching `cfg.callTimeout == 0`.
pub async fn run_with_timeout<T, F>(deadline: Duration, fut: F) -> TimedResult<T>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    let start = Instant::now();
    if deadline.is_zero() {
        let result = fut.await;
        return TimedResult {
            result,
            elapsed: start.elapsed(),
        };
    }

    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => TimedResult {
            result,
            elapsed: start.elapsed(),
        },
        Err(_elapsed) => TimedResult {
            result: Err(RuntimeError::Timeout { after: deadline }),
            elapsed: start.elapsed(),
        },
    }
}

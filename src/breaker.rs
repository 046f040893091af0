//! Circuit breaker state machine (C4): CLOSED / OPEN / HALF-OPEN per key.
//!
//! Grounded in the teacher's `CircuitBreakerWrapper`/`Inner`/`State` in
//! `reliability.rs` — same three states, same single-probe-in-flight flag.
//! What changed: the teacher trips the breaker by counting consecutive
//! per-call failures; this breaker only ever transitions on a
//! [`CmdKeyStatsSnapshot`] tick, and preserves the `max_failures - 1`
//! off-by-one the spec requires (the sample that crosses the threshold is
//! already included in the snapshot that reports it).

use crate::config::BreakerConfig;
use crate::stats::CmdKeyStatsSnapshot;
use std::time::{Duration, Instant};

/// The breaker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { opened_at: Instant, reset_at: Instant },
    HalfOpen,
}

/// What an admission check decided for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the command normally.
    Admit,
    /// Run the command as the HALF-OPEN probe.
    AdmitProbe,
    /// Hold the submission until the in-flight probe resolves.
    Stash,
    /// Reject immediately; breaker is OPEN.
    Reject { remaining: Duration },
}

/// Per-key breaker. Not `Sync` by itself — callers serialize access to it
/// through the executor's per-key `tokio::sync::Mutex` (see
/// `executor.rs`), exactly the way the teacher serializes access to
/// `CircuitBreakerWrapper::Inner` through a `std::sync::Mutex`.
pub struct Breaker {
    state: BreakerState,
    probe_in_flight: bool,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            probe_in_flight: false,
        }
    }
}

impl Breaker {
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Decide admission for a fresh submission arriving right now.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Admit,
            BreakerState::Open { reset_at, .. } => Admission::Reject {
                remaining: reset_at.saturating_duration_since(now),
            },
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Stash
                } else {
                    self.probe_in_flight = true;
                    Admission::AdmitProbe
                }
            }
        }
    }

    /// Apply a stats snapshot. Only ever called with the breaker already
    /// known to be in `Closed` or `Open` (HALF-OPEN never receives
    /// transitioning snapshots in the seed scenarios, but accepting one
    /// while HALF-OPEN is harmless and a no-op per the edge policy that
    /// transitions are snapshot-driven for CLOSED only).
    ///
    /// Returns `Some(reset_at)` when this call causes a CLOSED -> OPEN
    /// transition, so the caller can schedule a `TryCloseBreaker` timer.
    pub fn on_snapshot(
        &mut self,
        snapshot: &CmdKeyStatsSnapshot,
        cfg: &BreakerConfig,
        now: Instant,
    ) -> Option<Instant> {
        if let BreakerState::Closed = self.state {
            let threshold = cfg.max_failures.saturating_sub(1);
            if snapshot.call_stats.timeout as u32 >= threshold {
                let reset_at = now + cfg.reset_timeout;
                self.state = BreakerState::Open {
                    opened_at: now,
                    reset_at,
                };
                return Some(reset_at);
            }
        }
        // OPEN: counters still update via the stats aggregator, but a
        // snapshot alone never transitions an already-open breaker.
        None
    }

    /// Apply a fired `TryCloseBreaker` timer. A no-op unless the breaker is
    /// still OPEN (idempotent: a timer that fires after an intervening
    /// transition has no effect).
    pub fn on_try_close(&mut self) {
        if let BreakerState::Open { .. } = self.state {
            self.state = BreakerState::HalfOpen;
            self.probe_in_flight = false;
        }
    }

    /// Apply the outcome of the HALF-OPEN probe call.
    ///
    /// Returns `Some(reset_at)` when the probe failed and a new
    /// `TryCloseBreaker` timer must be scheduled (the breaker re-opened).
    pub fn on_probe_result(
        &mut self,
        succeeded: bool,
        cfg: &BreakerConfig,
        now: Instant,
    ) -> Option<Instant> {
        if !matches!(self.state, BreakerState::HalfOpen) {
            // The probe's completion arrived after some other transition
            // already moved the breaker elsewhere; nothing to do.
            return None;
        }
        self.probe_in_flight = false;
        if succeeded {
            self.state = BreakerState::Closed;
            None
        } else {
            let reset_at = now + cfg.reset_timeout;
            self.state = BreakerState::Open {
                opened_at: now,
                reset_at,
            };
            Some(reset_at)
        }
    }
}

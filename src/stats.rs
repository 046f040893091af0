//! Call stats aggregator (C1): ingests per-call outcomes into a sliding
//! window of ring buckets and emits periodic immutable snapshots.
//!
//! The percentile engine is an [`hdrhistogram::Histogram`], the same crate
//! and pattern the example pack's `kimberlite-bench` crate uses for its
//! `LatencyTracker`.

use hdrhistogram::Histogram;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default bucket width: 100ms.
pub const BUCKET_WIDTH: Duration = Duration::from_millis(100);
/// Default bucket count: 10, giving a 1s sliding window.
pub const BUCKET_COUNT: usize = 10;
/// Default tick interval at which snapshots are emitted.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// One outcome event reported by the executor as a call completes.
#[derive(Debug, Clone, Copy)]
pub enum CallEvent {
    /// The command body produced a value within the deadline.
    Success { latency: Duration },
    /// The command body failed with a domain error within the deadline.
    Error { latency: Duration },
    /// The command body did not complete before the deadline.
    Timeout { latency: Duration },
    /// The breaker rejected the call before it ran.
    BreakerOpenRejected,
}

/// Running counters over the current sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub succ: u64,
    pub err: u64,
    pub timeout: u64,
    pub cb_open: u64,
}

impl CallStats {
    fn add(&mut self, other: &CallStats) {
        self.succ = self.succ.saturating_add(other.succ);
        self.err = self.err.saturating_add(other.err);
        self.timeout = self.timeout.saturating_add(other.timeout);
        self.cb_open = self.cb_open.saturating_add(other.cb_open);
    }
}

/// Latency percentiles computed from the window's merged histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// Immutable summary of recent call outcomes, emitted on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdKeyStatsSnapshot {
    pub call_stats: CallStats,
    pub latency_percentiles: LatencyPercentiles,
    pub window_start: Option<Instant>,
}

struct Bucket {
    /// Index of the bucket slot this instance was last written for, i.e.
    /// `floor(t / BUCKET_WIDTH)`. Used to detect and clear staleness when
    /// the ring wraps back around to this slot.
    slot: u64,
    stats: CallStats,
    histogram: Histogram<u64>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            slot: u64::MAX,
            stats: CallStats::default(),
            histogram: Histogram::new(3).expect("valid histogram config"),
        }
    }

    fn reset_for(&mut self, slot: u64) {
        self.slot = slot;
        self.stats = CallStats::default();
        self.histogram.reset();
    }
}

struct Ring {
    buckets: Vec<Bucket>,
    start: Instant,
}

impl Ring {
    fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
            start: Instant::now(),
        }
    }

    fn slot_for(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.start).as_nanos() / BUCKET_WIDTH.as_nanos()) as u64
    }

    fn current_mut(&mut self, now: Instant) -> &mut Bucket {
        let slot = self.slot_for(now);
        let idx = (slot as usize) % BUCKET_COUNT;
        let bucket = &mut self.buckets[idx];
        if bucket.slot != slot {
            bucket.reset_for(slot);
        }
        bucket
    }

    /// Merge every bucket that falls within the last `BUCKET_COUNT` slots
    /// of `now` into one snapshot. Stale buckets (overwritten long ago, or
    /// never written) contribute nothing.
    fn snapshot(&self, now: Instant) -> CmdKeyStatsSnapshot {
        let newest_slot = self.slot_for(now);
        let oldest_slot = newest_slot.saturating_sub(BUCKET_COUNT as u64 - 1);
        let mut stats = CallStats::default();
        let mut merged = Histogram::<u64>::new(3).expect("valid histogram config");
        for bucket in &self.buckets {
            if bucket.slot >= oldest_slot && bucket.slot <= newest_slot {
                stats.add(&bucket.stats);
                merged.add(&bucket.histogram).ok();
            }
        }
        let latency_percentiles = LatencyPercentiles {
            p50: Duration::from_micros(merged.value_at_quantile(0.50)),
            p95: Duration::from_micros(merged.value_at_quantile(0.95)),
            p99: Duration::from_micros(merged.value_at_quantile(0.99)),
        };
        let offset_nanos = (BUCKET_WIDTH.as_nanos() * oldest_slot as u128).min(u64::MAX as u128);
        CmdKeyStatsSnapshot {
            call_stats: stats,
            latency_percentiles,
            window_start: Some(self.start + Duration::from_nanos(offset_nanos as u64)),
        }
    }
}

/// Per-key stats aggregator. Owns a ring of buckets guarded by a
/// `std::sync::Mutex` (outcome reporting is a short, non-async critical
/// section, matching the teacher's own choice of `std::sync::Mutex` for
/// `CircuitBreakerWrapper`'s state) and a background tick task that pushes
/// snapshots to whoever is listening.
pub struct StatsAggregator {
    ring: Mutex<Ring>,
    key: String,
}

impl StatsAggregator {
    /// Create a new aggregator and spawn its tick task, which sends a
    /// [`CmdKeyStatsSnapshot`] on `tick` until the returned
    /// `mpsc::UnboundedReceiver` (and every clone of the returned `Arc`) is
    /// dropped.
    pub fn spawn(
        key: impl Into<String>,
        tick: Duration,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<CmdKeyStatsSnapshot>) {
        let this = std::sync::Arc::new(Self {
            ring: Mutex::new(Ring::new()),
            key: key.into(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = std::sync::Arc::downgrade(&this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                let Some(agg) = weak.upgrade() else { break };
                let snapshot = agg.snapshot();
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
        });
        (this, rx)
    }

    /// Report one call outcome. Saturates rather than panics on overflow.
    pub fn report(&self, evt: CallEvent) {
        let now = Instant::now();
        let mut ring = match self.ring.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = ring.current_mut(now);
        match evt {
            CallEvent::Success { latency } => {
                bucket.stats.succ = bucket.stats.succ.saturating_add(1);
                bucket.histogram.record(latency.as_micros() as u64).ok();
            }
            CallEvent::Error { latency } => {
                bucket.stats.err = bucket.stats.err.saturating_add(1);
                bucket.histogram.record(latency.as_micros() as u64).ok();
            }
            CallEvent::Timeout { latency } => {
                bucket.stats.timeout = bucket.stats.timeout.saturating_add(1);
                bucket.histogram.record(latency.as_micros() as u64).ok();
            }
            CallEvent::BreakerOpenRejected => {
                bucket.stats.cb_open = bucket.stats.cb_open.saturating_add(1);
            }
        }
        metrics::counter!("jailcall.calls.total", "key" => self.key.clone(), "outcome" => outcome_label(&evt))
            .increment(1);
    }

    /// Compute a snapshot of the current window on demand (used by tests
    /// and by the tick task).
    pub fn snapshot(&self) -> CmdKeyStatsSnapshot {
        let ring = match self.ring.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.snapshot(Instant::now())
    }
}

fn outcome_label(evt: &CallEvent) -> &'static str {
    match evt {
        CallEvent::Success { .. } => "success",
        CallEvent::Error { .. } => "error",
        CallEvent::Timeout { .. } => "timeout",
        CallEvent::BreakerOpenRejected => "breaker_open",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_aggregator_snapshot_is_zero() {
        let (agg, _rx) = StatsAggregator::spawn("k", DEFAULT_TICK);
        let snap = agg.snapshot();
        assert_eq!(snap.call_stats, CallStats::default());
    }

    #[test]
    fn report_increments_matching_counter() {
        let (agg, _rx) = StatsAggregator::spawn("k", DEFAULT_TICK);
        agg.report(CallEvent::Success {
            latency: Duration::from_millis(5),
        });
        agg.report(CallEvent::Timeout {
            latency: Duration::from_millis(10),
        });
        agg.report(CallEvent::BreakerOpenRejected);
        let snap = agg.snapshot();
        assert_eq!(snap.call_stats.succ, 1);
        assert_eq!(snap.call_stats.timeout, 1);
        assert_eq!(snap.call_stats.cb_open, 1);
        assert_eq!(snap.call_stats.err, 0);
    }

    #[tokio::test]
    async fn tick_task_emits_snapshots() {
        let (agg, mut rx) = StatsAggregator::spawn("k", Duration::from_millis(20));
        agg.report(CallEvent::Success {
            latency: Duration::from_millis(1),
        });
        let snap = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("tick fired")
            .expect("channel open");
        assert_eq!(snap.call_stats.succ, 1);
    }

    #[test]
    fn percentiles_reflect_recorded_latencies() {
        let (agg, _rx) = StatsAggregator::spawn("k", DEFAULT_TICK);
        for ms in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            agg.report(CallEvent::Success {
                latency: Duration::from_millis(ms),
            });
        }
        let snap = agg.snapshot();
        assert!(snap.latency_percentiles.p50 >= Duration::from_millis(40));
        assert!(snap.latency_percentiles.p99 >= snap.latency_percentiles.p50);
    }
}

//! Per-host load metrics read by balancing strategies.
//!
//! The default implementation is a peak-sensitive exponentially weighted
//! moving average of observed latency, combined with the count of in-flight
//! requests: a latency spike is tracked instantly, while recovery decays
//! back toward the historical average.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The ongoing-activity and latency signal a strategy reads for one host.
pub trait LoadBalancingMetric: Send + Sync {
    /// Requests currently in flight against this host.
    fn ongoing_activities(&self) -> usize;

    /// The host's current cost; lower is better. Strategies that only care
    /// about queue depth can ignore this and use [`ongoing_activities`].
    ///
    /// [`ongoing_activities`]: LoadBalancingMetric::ongoing_activities
    fn score(&self) -> f64;

    /// Marks the start of one dispatch.
    fn begin_activity(&self);

    /// Marks the end of one dispatch, completed or cancelled.
    fn end_activity(&self);

    /// Feeds one observed round-trip latency sample.
    fn observe_latency(&self, rtt_ms: f64);
}

/// Peak-EWMA latency tracker doubling as the in-flight counter.
#[derive(Debug)]
pub struct PeakEwma {
    /// Current moving average, stored as `f64` bits for lock-free updates.
    ewma: AtomicU64,
    /// Decay rate. Higher alpha weights history more; lower favors recent samples.
    decay_alpha: f64,
    /// Requests currently in flight.
    ongoing: AtomicUsize,
}

impl PeakEwma {
    /// Creates a tracker seeded with an initial latency estimate.
    pub fn new(initial_latency_ms: f64, decay_alpha: f64) -> Self {
        Self {
            ewma: AtomicU64::new(initial_latency_ms.to_bits()),
            decay_alpha,
            ongoing: AtomicUsize::new(0),
        }
    }

    /// The current moving average in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        f64::from_bits(self.ewma.load(Ordering::Relaxed))
    }
}

impl Default for PeakEwma {
    fn default() -> Self {
        Self::new(0.0, 0.5)
    }
}

impl LoadBalancingMetric for PeakEwma {
    fn ongoing_activities(&self) -> usize {
        self.ongoing.load(Ordering::Relaxed)
    }

    /// Score = (EWMA latency + 1) * (in-flight + 1); the +1 terms keep a
    /// fresh host from scoring an absolute zero.
    fn score(&self) -> f64 {
        (self.latency_ms() + 1.0) * (self.ongoing_activities() as f64 + 1.0)
    }

    fn begin_activity(&self) {
        self.ongoing.fetch_add(1, Ordering::Relaxed);
    }

    fn end_activity(&self) {
        self.ongoing.fetch_sub(1, Ordering::Relaxed);
    }

    fn observe_latency(&self, rtt_ms: f64) {
        let mut current_bits = self.ewma.load(Ordering::Acquire);

        loop {
            let current_ewma = f64::from_bits(current_bits);

            // A sample above the average is a peak: jump to it. A sample
            // below it decays the average toward the sample.
            let next_ewma = if rtt_ms > current_ewma {
                rtt_ms
            } else {
                (rtt_ms * (1.0 - self.decay_alpha)) + (current_ewma * self.decay_alpha)
            };

            match self.ewma.compare_exchange_weak(
                current_bits,
                next_ewma.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(updated_bits) => current_bits = updated_bits,
            }
        }
    }
}

/// RAII guard for one in-flight request.
///
/// Increments the metric on creation and decrements on drop, so cancellation
/// (dropping the dispatch future) can never leave the apparent load of an
/// origin inflated.
pub struct InFlightGuard {
    metric: Arc<dyn LoadBalancingMetric>,
    started: Instant,
}

impl InFlightGuard {
    /// Begins tracking one dispatch against the given metric.
    pub fn track(metric: Arc<dyn LoadBalancingMetric>) -> Self {
        metric.begin_activity();
        Self {
            metric,
            started: Instant::now(),
        }
    }

    /// When the dispatch started.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Records the elapsed time as a latency sample. Called on success only;
    /// failed attempts say nothing about the origin's service time.
    pub fn observe_latency(&self) {
        self.metric
            .observe_latency(self.started.elapsed().as_secs_f64() * 1_000.0);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metric.end_activity();
    }
}

//! The metrics-sink boundary and an in-process atomic implementation.
//!
//! The core records per-application/origin outcomes here; wiring a real
//! metrics backend is out of scope and happens behind [`MetricsSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use riptide_core::origin::{AppId, OriginId};

/// Receives request and health outcomes, per application and origin.
///
/// Health-check failures are counted separately from request-path failures.
pub trait MetricsSink: Send + Sync {
    /// One successful proxied attempt, with its latency and time-to-first-byte.
    fn request_success(&self, app: &AppId, origin: &OriginId, latency: Duration, ttfb: Duration);

    /// One failed proxied attempt.
    fn request_error(&self, app: &AppId, origin: &OriginId);

    /// One attempt cancelled by client disconnect.
    fn request_cancelled(&self, app: &AppId, origin: &OriginId);

    /// A response status observed from an origin.
    fn response_status(&self, app: &AppId, origin: &OriginId, status: u16);

    /// One failed health probe. Internal; never fails a proxied request.
    fn health_check_failure(&self, app: &AppId, origin: &OriginId);
}

/// A sink that records nothing.
#[derive(Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn request_success(&self, _: &AppId, _: &OriginId, _: Duration, _: Duration) {}
    fn request_error(&self, _: &AppId, _: &OriginId) {}
    fn request_cancelled(&self, _: &AppId, _: &OriginId) {}
    fn response_status(&self, _: &AppId, _: &OriginId, _: u16) {}
    fn health_check_failure(&self, _: &AppId, _: &OriginId) {}
}

/// Per-origin counters.
#[derive(Debug, Default)]
pub struct OriginMetrics {
    success: AtomicU64,
    error: AtomicU64,
    cancelled: AtomicU64,
    health_check_failures: AtomicU64,
    latency_total_micros: AtomicU64,
    ttfb_total_micros: AtomicU64,
    statuses: DashMap<u16, AtomicU64>,
}

impl OriginMetrics {
    /// Successful attempts.
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    /// Failed attempts.
    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    /// Cancelled attempts.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Failed health probes.
    pub fn health_check_failures(&self) -> u64 {
        self.health_check_failures.load(Ordering::Relaxed)
    }

    /// Mean latency over successful attempts.
    pub fn mean_latency(&self) -> Duration {
        let count = self.success().max(1);
        Duration::from_micros(self.latency_total_micros.load(Ordering::Relaxed) / count)
    }

    /// Mean time-to-first-byte over successful attempts.
    pub fn mean_ttfb(&self) -> Duration {
        let count = self.success().max(1);
        Duration::from_micros(self.ttfb_total_micros.load(Ordering::Relaxed) / count)
    }

    /// Observations of one response status code.
    pub fn status_count(&self, status: u16) -> u64 {
        self.statuses
            .get(&status)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// In-process metrics registry keyed by (application, origin).
#[derive(Debug, Default)]
pub struct InProcessMetrics {
    origins: DashMap<(AppId, OriginId), Arc<OriginMetrics>>,
}

impl InProcessMetrics {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters for one origin, created on first use.
    pub fn origin(&self, app: &AppId, origin: &OriginId) -> Arc<OriginMetrics> {
        self.origins
            .entry((app.clone(), origin.clone()))
            .or_default()
            .clone()
    }
}

impl MetricsSink for InProcessMetrics {
    fn request_success(&self, app: &AppId, origin: &OriginId, latency: Duration, ttfb: Duration) {
        let metrics = self.origin(app, origin);
        metrics.success.fetch_add(1, Ordering::Relaxed);
        metrics
            .latency_total_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        metrics
            .ttfb_total_micros
            .fetch_add(ttfb.as_micros() as u64, Ordering::Relaxed);
    }

    fn request_error(&self, app: &AppId, origin: &OriginId) {
        self.origin(app, origin).error.fetch_add(1, Ordering::Relaxed);
    }

    fn request_cancelled(&self, app: &AppId, origin: &OriginId) {
        self.origin(app, origin)
            .cancelled
            .fetch_add(1, Ordering::Relaxed);
    }

    fn response_status(&self, app: &AppId, origin: &OriginId, status: u16) {
        self.origin(app, origin)
            .statuses
            .entry(status)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn health_check_failure(&self, app: &AppId, origin: &OriginId) {
        self.origin(app, origin)
            .health_check_failures
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_origin() {
        let metrics = InProcessMetrics::new();
        let app = AppId::new("webapp");
        let o0 = OriginId::new("o0");
        let o1 = OriginId::new("o1");

        metrics.request_success(&app, &o0, Duration::from_millis(10), Duration::from_millis(2));
        metrics.request_error(&app, &o0);
        metrics.request_error(&app, &o1);
        metrics.response_status(&app, &o0, 200);
        metrics.response_status(&app, &o0, 200);
        metrics.response_status(&app, &o0, 502);

        let o0_metrics = metrics.origin(&app, &o0);
        assert_eq!(o0_metrics.success(), 1);
        assert_eq!(o0_metrics.error(), 1);
        assert_eq!(o0_metrics.status_count(200), 2);
        assert_eq!(o0_metrics.status_count(502), 1);
        assert_eq!(metrics.origin(&app, &o1).error(), 1);
    }

    #[test]
    fn health_check_failures_are_separate_from_request_errors() {
        let metrics = InProcessMetrics::new();
        let app = AppId::new("webapp");
        let o0 = OriginId::new("o0");

        metrics.health_check_failure(&app, &o0);
        metrics.health_check_failure(&app, &o0);

        let o0_metrics = metrics.origin(&app, &o0);
        assert_eq!(o0_metrics.health_check_failures(), 2);
        assert_eq!(o0_metrics.error(), 0);
    }
}

//! Health monitoring contracts and anomaly suppression.
//!
//! Event delivery is synchronous, in listener-registration order, on the
//! thread performing the health check. This ordering is part of the contract
//! and must not be changed to asynchronous fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::ServiceError;
use crate::origin::Origin;

/// The two polarities a health check can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The origin answered its probe.
    Healthy,
    /// The probe failed, timed out, or could not connect.
    Unhealthy,
}

/// Receives forwarded health transitions and monitoring-lifecycle events.
pub trait HealthEventListener: Send + Sync {
    /// The origin transitioned to healthy.
    fn origin_healthy(&self, origin: &Origin);

    /// The origin transitioned to unhealthy.
    fn origin_unhealthy(&self, origin: &Origin);

    /// Monitoring of the origin stopped. Not a health event.
    fn monitoring_ended(&self, origin: &Origin);
}

/// Periodically probes monitored origins and reports transitions.
pub trait HealthStatusMonitor: Send + Sync {
    /// Adds origins to the monitored set, duplicate-safe. A running monitor
    /// immediately schedules a check for newly added origins.
    fn monitor(&self, origins: Vec<Origin>);

    /// Removes origins from the monitored set, synchronously notifying
    /// listeners with one `monitoring_ended` per removed origin.
    fn stop_monitoring(&self, origins: &[Origin]);

    /// Registers a listener, invoked for every forwarded event in
    /// registration order.
    fn add_listener(&self, listener: Arc<dyn HealthEventListener>);
}

impl<M: HealthStatusMonitor + ?Sized> HealthStatusMonitor for Arc<M> {
    fn monitor(&self, origins: Vec<Origin>) {
        (**self).monitor(origins);
    }

    fn stop_monitoring(&self, origins: &[Origin]) {
        (**self).stop_monitoring(origins);
    }

    fn add_listener(&self, listener: Arc<dyn HealthEventListener>) {
        (**self).add_listener(listener);
    }
}

/// A monitor that never reports anything; used when a service has no
/// health-check URI configured.
#[derive(Debug, Default)]
pub struct NoHealthStatusMonitor;

impl HealthStatusMonitor for NoHealthStatusMonitor {
    fn monitor(&self, _origins: Vec<Origin>) {}

    fn stop_monitoring(&self, _origins: &[Origin]) {}

    fn add_listener(&self, _listener: Arc<dyn HealthEventListener>) {}
}

/// Anomaly-suppressing decorator.
///
/// Requires `healthy_threshold` consecutive healthy results (or
/// `unhealthy_threshold` consecutive unhealthy ones) from the same origin
/// before forwarding exactly one transition event; a result of the opposite
/// polarity resets that origin's consecutive counter to 1.
pub struct AnomalyExcludingMonitor<M> {
    inner: M,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl<M: HealthStatusMonitor> AnomalyExcludingMonitor<M> {
    /// Wraps a monitor. Both thresholds must be at least 1.
    pub fn new(
        inner: M,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Result<Self, ServiceError> {
        if healthy_threshold < 1 {
            return Err(ServiceError::InvalidHealthThreshold(healthy_threshold as i64));
        }
        if unhealthy_threshold < 1 {
            return Err(ServiceError::InvalidHealthThreshold(unhealthy_threshold as i64));
        }
        Ok(Self {
            inner,
            healthy_threshold,
            unhealthy_threshold,
        })
    }
}

impl<M: HealthStatusMonitor> HealthStatusMonitor for AnomalyExcludingMonitor<M> {
    fn monitor(&self, origins: Vec<Origin>) {
        self.inner.monitor(origins);
    }

    fn stop_monitoring(&self, origins: &[Origin]) {
        self.inner.stop_monitoring(origins);
    }

    fn add_listener(&self, listener: Arc<dyn HealthEventListener>) {
        self.inner.add_listener(Arc::new(AnomalyExcludingListener::new(
            listener,
            self.healthy_threshold,
            self.unhealthy_threshold,
        )));
    }
}

/// Per-origin consecutive-result tracking.
#[derive(Debug, Clone, Copy)]
struct OriginRun {
    polarity: HealthStatus,
    consecutive: u32,
    reported: Option<HealthStatus>,
}

/// The listener-side filter the [`AnomalyExcludingMonitor`] installs around
/// each registered listener.
pub struct AnomalyExcludingListener {
    inner: Arc<dyn HealthEventListener>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    runs: Mutex<HashMap<(String, String), OriginRun>>,
}

impl AnomalyExcludingListener {
    /// Wraps a listener with the given thresholds. Thresholds are validated
    /// by [`AnomalyExcludingMonitor::new`].
    pub fn new(
        inner: Arc<dyn HealthEventListener>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Self {
        Self {
            inner,
            healthy_threshold,
            unhealthy_threshold,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn key(origin: &Origin) -> (String, String) {
        (
            origin.application().as_str().to_string(),
            origin.id().as_str().to_string(),
        )
    }

    /// Records one raw result; returns true when the transition should be
    /// forwarded.
    fn should_forward(&self, origin: &Origin, status: HealthStatus) -> bool {
        let threshold = match status {
            HealthStatus::Healthy => self.healthy_threshold,
            HealthStatus::Unhealthy => self.unhealthy_threshold,
        };

        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let run = runs.entry(Self::key(origin)).or_insert(OriginRun {
            polarity: status,
            consecutive: 0,
            reported: None,
        });

        if run.polarity == status {
            run.consecutive += 1;
        } else {
            run.polarity = status;
            run.consecutive = 1;
        }

        if run.consecutive >= threshold && run.reported != Some(status) {
            run.reported = Some(status);
            true
        } else {
            false
        }
    }
}

impl HealthEventListener for AnomalyExcludingListener {
    fn origin_healthy(&self, origin: &Origin) {
        if self.should_forward(origin, HealthStatus::Healthy) {
            self.inner.origin_healthy(origin);
        }
    }

    fn origin_unhealthy(&self, origin: &Origin) {
        if self.should_forward(origin, HealthStatus::Unhealthy) {
            self.inner.origin_unhealthy(origin);
        }
    }

    fn monitoring_ended(&self, origin: &Origin) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&Self::key(origin));
        self.inner.monitoring_ended(origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl HealthEventListener for RecordingListener {
        fn origin_healthy(&self, origin: &Origin) {
            self.events.lock().unwrap().push(format!("healthy:{}", origin.id()));
        }

        fn origin_unhealthy(&self, origin: &Origin) {
            self.events.lock().unwrap().push(format!("unhealthy:{}", origin.id()));
        }

        fn monitoring_ended(&self, origin: &Origin) {
            self.events.lock().unwrap().push(format!("ended:{}", origin.id()));
        }
    }

    fn origin(id: &str) -> Origin {
        Origin::builder("webapp", id)
            .host("localhost")
            .port(9000)
            .build()
            .unwrap()
    }

    fn filter(listener: Arc<RecordingListener>) -> AnomalyExcludingListener {
        AnomalyExcludingListener::new(listener, 2, 2)
    }

    #[test]
    fn two_consecutive_unhealthy_results_fire_once() {
        let recording = Arc::new(RecordingListener::default());
        let suppressing = filter(recording.clone());
        let a = origin("a");

        suppressing.origin_unhealthy(&a);
        assert!(recording.events().is_empty());

        suppressing.origin_unhealthy(&a);
        assert_eq!(recording.events(), vec!["unhealthy:a"]);

        // Further unhealthy results do not re-fire.
        suppressing.origin_unhealthy(&a);
        assert_eq!(recording.events(), vec!["unhealthy:a"]);
    }

    #[test]
    fn single_healthy_result_does_not_yet_recover() {
        let recording = Arc::new(RecordingListener::default());
        let suppressing = filter(recording.clone());
        let a = origin("a");

        suppressing.origin_unhealthy(&a);
        suppressing.origin_unhealthy(&a);
        suppressing.origin_healthy(&a);
        assert_eq!(recording.events(), vec!["unhealthy:a"]);

        suppressing.origin_healthy(&a);
        assert_eq!(recording.events(), vec!["unhealthy:a", "healthy:a"]);
    }

    #[test]
    fn opposite_polarity_resets_the_run() {
        let recording = Arc::new(RecordingListener::default());
        let suppressing = filter(recording.clone());
        let a = origin("a");

        suppressing.origin_unhealthy(&a);
        suppressing.origin_healthy(&a);
        suppressing.origin_unhealthy(&a);
        // Never two consecutive of the same polarity, so nothing forwarded.
        assert!(recording.events().is_empty());
    }

    #[test]
    fn origins_are_tracked_independently() {
        let recording = Arc::new(RecordingListener::default());
        let suppressing = filter(recording.clone());

        suppressing.origin_unhealthy(&origin("a"));
        suppressing.origin_unhealthy(&origin("b"));
        assert!(recording.events().is_empty());

        suppressing.origin_unhealthy(&origin("a"));
        assert_eq!(recording.events(), vec!["unhealthy:a"]);
    }

    #[test]
    fn monitoring_ended_passes_through_and_clears_state() {
        let recording = Arc::new(RecordingListener::default());
        let suppressing = filter(recording.clone());
        let a = origin("a");

        suppressing.origin_unhealthy(&a);
        suppressing.monitoring_ended(&a);
        assert_eq!(recording.events(), vec!["ended:a"]);

        // State was cleared; the run starts over.
        suppressing.origin_unhealthy(&a);
        assert_eq!(recording.events(), vec!["ended:a"]);
    }

    #[test]
    fn non_positive_thresholds_fail_construction() {
        assert!(AnomalyExcludingMonitor::new(NoHealthStatusMonitor, 0, 2).is_err());
        assert!(AnomalyExcludingMonitor::new(NoHealthStatusMonitor, 2, 0).is_err());
        assert!(AnomalyExcludingMonitor::new(NoHealthStatusMonitor, 1, 1).is_ok());
    }
}

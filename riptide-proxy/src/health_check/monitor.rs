//! A scheduled health monitor that drives probe functions from one
//! background task per monitored application.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use riptide_core::health::{HealthEventListener, HealthStatusMonitor};
use riptide_core::origin::Origin;

use crate::health_check::probe::HealthCheckFunction;
use crate::metrics::MetricsSink;

enum Command {
    CheckNow(Vec<Origin>),
    Shutdown,
}

struct Shared {
    probe: Arc<dyn HealthCheckFunction>,
    probe_timeout: Duration,
    monitored: Mutex<Vec<Origin>>,
    listeners: Mutex<Vec<Arc<dyn HealthEventListener>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Shared {
    /// Probes one origin with the configured timeout and reports the raw
    /// result to every listener. Transition filtering happens downstream.
    async fn check(&self, origin: &Origin) {
        let healthy = time::timeout(self.probe_timeout, self.probe.check(origin))
            .await
            .unwrap_or(false);
        if !healthy {
            self.metrics
                .health_check_failure(origin.application(), origin.id());
        }
        debug!(origin = %origin.id(), healthy, "health probe completed");
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            if healthy {
                listener.origin_healthy(origin);
            } else {
                listener.origin_unhealthy(origin);
            }
        }
    }
}

/// Periodically probes a set of origins on a single background task.
///
/// Every probe result is reported to the listeners; wrap the monitor in
/// [`riptide_core::health::AnomalyExcludingMonitor`] to turn raw results
/// into state transitions.
pub struct ScheduledHealthMonitor {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ScheduledHealthMonitor {
    /// Spawns the probe scheduler and returns the monitor handle.
    pub fn start(
        probe: Arc<dyn HealthCheckFunction>,
        interval: Duration,
        probe_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            probe,
            probe_timeout,
            monitored: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            metrics,
        });
        let (commands, mut receiver) = mpsc::unbounded_channel();
        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let origins = task_shared
                            .monitored
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        for origin in &origins {
                            task_shared.check(origin).await;
                        }
                    }
                    command = receiver.recv() => match command {
                        Some(Command::CheckNow(origins)) => {
                            for origin in &origins {
                                task_shared.check(origin).await;
                            }
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
            }
            debug!("health probe scheduler stopped");
        });
        Arc::new(Self { shared, commands })
    }

    /// Stops the scheduler task. Monitored state is left in place so that a
    /// final `stop_monitoring` still notifies listeners.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl HealthStatusMonitor for ScheduledHealthMonitor {
    fn monitor(&self, origins: Vec<Origin>) {
        let mut added = Vec::new();
        {
            let mut monitored = self
                .shared
                .monitored
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for origin in origins {
                if !monitored.iter().any(|known| known == &origin) {
                    monitored.push(origin.clone());
                    added.push(origin);
                }
            }
        }
        if !added.is_empty() && self.commands.send(Command::CheckNow(added)).is_err() {
            warn!("health probe scheduler is no longer running");
        }
    }

    fn stop_monitoring(&self, origins: &[Origin]) {
        let removed: HashSet<&Origin> = origins.iter().collect();
        let mut ended = Vec::new();
        {
            let mut monitored = self
                .shared
                .monitored
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            monitored.retain(|origin| {
                if removed.contains(origin) {
                    ended.push(origin.clone());
                    false
                } else {
                    true
                }
            });
        }
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for origin in &ended {
            for listener in &listeners {
                listener.monitoring_ended(origin);
            }
        }
    }

    fn add_listener(&self, listener: Arc<dyn HealthEventListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_check::probe::ProbeFuture;
    use crate::metrics::{InProcessMetrics, NullMetricsSink};
    use riptide_core::origin::Origin;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedProbe {
        healthy: AtomicBool,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    impl HealthCheckFunction for ScriptedProbe {
        fn check(&self, _origin: &Origin) -> ProbeFuture {
            let healthy = self.healthy.load(Ordering::SeqCst);
            Box::pin(async move { healthy })
        }
    }

    struct HangingProbe;

    impl HealthCheckFunction for HangingProbe {
        fn check(&self, _origin: &Origin) -> ProbeFuture {
            Box::pin(std::future::pending())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl HealthEventListener for RecordingListener {
        fn origin_healthy(&self, origin: &Origin) {
            self.events
                .lock()
                .unwrap()
                .push(format!("healthy:{}", origin.id()));
        }

        fn origin_unhealthy(&self, origin: &Origin) {
            self.events
                .lock()
                .unwrap()
                .push(format!("unhealthy:{}", origin.id()));
        }

        fn monitoring_ended(&self, origin: &Origin) {
            self.events
                .lock()
                .unwrap()
                .push(format!("ended:{}", origin.id()));
        }
    }

    fn origin(id: &str, port: u16) -> Origin {
        Origin::builder("webapp", id)
            .host("localhost")
            .port(port)
            .build()
            .unwrap()
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn newly_monitored_origins_are_checked_immediately() {
        let probe = ScriptedProbe::new(true);
        let monitor = ScheduledHealthMonitor::start(
            probe,
            Duration::from_secs(5),
            Duration::from_secs(2),
            Arc::new(NullMetricsSink),
        );
        let listener = Arc::new(RecordingListener::default());
        monitor.add_listener(listener.clone());

        monitor.monitor(vec![origin("o0", 9090)]);
        settle().await;

        assert_eq!(listener.events(), vec!["healthy:o0"]);
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn every_tick_reports_a_result_even_without_a_transition() {
        let probe = ScriptedProbe::new(false);
        let monitor = ScheduledHealthMonitor::start(
            probe,
            Duration::from_secs(5),
            Duration::from_secs(2),
            Arc::new(NullMetricsSink),
        );
        let listener = Arc::new(RecordingListener::default());
        monitor.add_listener(listener.clone());

        monitor.monitor(vec![origin("o0", 9090)]);
        settle().await;
        time::advance(Duration::from_secs(5)).await;
        settle().await;
        time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(
            listener.events(),
            vec!["unhealthy:o0", "unhealthy:o0", "unhealthy:o0"]
        );
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_counts_as_unhealthy() {
        let monitor = ScheduledHealthMonitor::start(
            Arc::new(HangingProbe),
            Duration::from_secs(5),
            Duration::from_secs(2),
            Arc::new(NullMetricsSink),
        );
        let listener = Arc::new(RecordingListener::default());
        monitor.add_listener(listener.clone());

        monitor.monitor(vec![origin("o0", 9090)]);
        settle().await;
        time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(listener.events(), vec!["unhealthy:o0"]);
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_fires_ended_synchronously() {
        let probe = ScriptedProbe::new(true);
        let monitor = ScheduledHealthMonitor::start(
            probe,
            Duration::from_secs(5),
            Duration::from_secs(2),
            Arc::new(NullMetricsSink),
        );
        let listener = Arc::new(RecordingListener::default());
        monitor.add_listener(listener.clone());

        let o0 = origin("o0", 9090);
        monitor.monitor(vec![o0.clone()]);
        settle().await;
        monitor.stop_monitoring(&[o0]);

        // No await between stop_monitoring and the assertion.
        assert_eq!(listener.events(), vec!["healthy:o0", "ended:o0"]);
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failures_are_counted_in_metrics() {
        let probe = ScriptedProbe::new(false);
        let metrics = Arc::new(InProcessMetrics::new());
        let monitor = ScheduledHealthMonitor::start(
            probe.clone(),
            Duration::from_secs(5),
            Duration::from_secs(2),
            metrics.clone(),
        );

        let o0 = origin("o0", 9090);
        monitor.monitor(vec![o0.clone()]);
        settle().await;
        probe.set_healthy(true);
        time::advance(Duration::from_secs(5)).await;
        settle().await;

        let counters = metrics.origin(o0.application(), o0.id());
        assert_eq!(counters.health_check_failures(), 1);
        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_is_duplicate_safe() {
        let probe = ScriptedProbe::new(true);
        let monitor = ScheduledHealthMonitor::start(
            probe,
            Duration::from_secs(5),
            Duration::from_secs(2),
            Arc::new(NullMetricsSink),
        );
        let listener = Arc::new(RecordingListener::default());
        monitor.add_listener(listener.clone());

        let o0 = origin("o0", 9090);
        monitor.monitor(vec![o0.clone()]);
        settle().await;
        monitor.monitor(vec![o0.clone()]);
        settle().await;

        // The second monitor() call must not schedule an extra check.
        assert_eq!(listener.events(), vec!["healthy:o0"]);
        monitor.shutdown();
    }
}

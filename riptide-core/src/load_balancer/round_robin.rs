//! Round-robin strategy: rotate the starting point through the active set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{
    apply_preferences, ActiveOrigins, LoadBalancer, LoadBalancingContext,
};
use crate::remote_host::RemoteHost;

/// Rotates through the active hosts so consecutive selections start from
/// successive origins. The full ordering is returned, rotated, so retry
/// fallbacks still cover every candidate.
pub struct RoundRobinStrategy {
    origins: Arc<dyn ActiveOrigins>,
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Creates the strategy over the given active-origins view.
    pub fn new(origins: Arc<dyn ActiveOrigins>) -> Self {
        Self {
            origins,
            next: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinStrategy {
    fn choose(&self, context: &LoadBalancingContext<'_>) -> Vec<RemoteHost> {
        let mut hosts = self.origins.active_hosts();
        if hosts.is_empty() {
            return hosts;
        }
        hosts.sort_by(|a, b| a.origin().cmp(b.origin()));
        let start = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        apply_preferences(hosts, context.preferences)
    }

    fn snapshot(&self) -> Vec<RemoteHost> {
        self.origins.active_hosts()
    }
}

//! Least-load strategy: order hosts by their current cost.

use std::sync::Arc;

use crate::load_balancer::{
    apply_preferences, ActiveOrigins, LoadBalancer, LoadBalancingContext,
};
use crate::remote_host::RemoteHost;

/// Orders the active hosts by ascending metric score, so the least busy
/// (and historically fastest) origin is tried first.
pub struct BusyActivitiesStrategy {
    origins: Arc<dyn ActiveOrigins>,
}

impl BusyActivitiesStrategy {
    /// Creates the strategy over the given active-origins view.
    pub fn new(origins: Arc<dyn ActiveOrigins>) -> Self {
        Self { origins }
    }
}

impl LoadBalancer for BusyActivitiesStrategy {
    fn choose(&self, context: &LoadBalancingContext<'_>) -> Vec<RemoteHost> {
        let mut hosts = self.origins.active_hosts();
        hosts.sort_by(|a, b| {
            a.metric()
                .score()
                .partial_cmp(&b.metric().score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        apply_preferences(hosts, context.preferences)
    }

    fn snapshot(&self) -> Vec<RemoteHost> {
        self.origins.active_hosts()
    }
}

//! The origins inventory: per-application registry of configured origins,
//! their lifecycle state, and atomically published snapshots.
//!
//! Readers go through [`OriginsInventory::snapshot`], an `ArcSwap` load that
//! never contends and never observes a partially updated set. Writers
//! (configuration reloads, health events, admin commands) serialize on a
//! registry mutex and publish complete snapshots atomically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::health::{HealthEventListener, HealthStatusMonitor};
use crate::load_balancer::ActiveOrigins;
use crate::origin::{AppId, Origin, OriginId};
use crate::remote_host::{RemoteHost, RemoteHostFactory};

/// Lifecycle state of one configured origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginState {
    /// Eligible for selection.
    Active,
    /// Taken out by health monitoring; returns when health recovers.
    Inactive,
    /// Taken out administratively; only an enable command brings it back.
    Disabled,
}

/// An immutable point-in-time view of one application's origins.
#[derive(Clone)]
pub struct OriginsSnapshot {
    app_id: AppId,
    active: Vec<RemoteHost>,
    inactive: Vec<Arc<Origin>>,
    disabled: Vec<Arc<Origin>>,
}

impl OriginsSnapshot {
    fn empty(app_id: AppId) -> Self {
        Self {
            app_id,
            active: Vec::new(),
            inactive: Vec::new(),
            disabled: Vec::new(),
        }
    }

    /// The application this snapshot describes.
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Hosts eligible for selection.
    pub fn active(&self) -> &[RemoteHost] {
        &self.active
    }

    /// Origins knocked out by health monitoring.
    pub fn inactive(&self) -> &[Arc<Origin>] {
        &self.inactive
    }

    /// Origins disabled administratively.
    pub fn disabled(&self) -> &[Arc<Origin>] {
        &self.disabled
    }
}

/// Notified with the fresh snapshot after every inventory mutation.
///
/// Callbacks run synchronously, in registration order, on the mutating
/// thread, and must not call back into the inventory.
pub trait OriginsChangeListener: Send + Sync {
    /// The inventory changed; `snapshot` is the newly published view.
    fn origins_changed(&self, snapshot: &OriginsSnapshot);
}

/// The outcome of diffing a new origin configuration against the registry.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OriginsDiff {
    /// Origin ids newly added (or re-added with changed attributes).
    pub added: Vec<OriginId>,
    /// Origin ids no longer configured.
    pub removed: Vec<OriginId>,
    /// Origin ids present before and after with identical attributes.
    pub unchanged: Vec<OriginId>,
}

struct MonitoredOrigin {
    origin: Arc<Origin>,
    host: RemoteHost,
    state: OriginState,
}

/// An inventory of the origins configured for a single application.
pub struct OriginsInventory {
    app_id: AppId,
    monitor: Arc<dyn HealthStatusMonitor>,
    host_factory: Arc<dyn RemoteHostFactory>,
    registry: Mutex<HashMap<OriginId, MonitoredOrigin>>,
    snapshot: ArcSwap<OriginsSnapshot>,
    listeners: Mutex<Vec<Arc<dyn OriginsChangeListener>>>,
}

impl OriginsInventory {
    /// Creates an inventory and registers it as the monitor's health
    /// listener. Origins are installed with [`set_origins`].
    ///
    /// [`set_origins`]: OriginsInventory::set_origins
    pub fn new(
        app_id: AppId,
        monitor: Arc<dyn HealthStatusMonitor>,
        host_factory: Arc<dyn RemoteHostFactory>,
    ) -> Arc<Self> {
        let inventory = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(OriginsSnapshot::empty(app_id.clone())),
            app_id,
            monitor: monitor.clone(),
            host_factory,
            registry: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        });
        monitor.add_listener(inventory.clone());
        inventory
    }

    /// The application id.
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// The latest published snapshot. Always a complete, consistent view.
    pub fn snapshot(&self) -> Arc<OriginsSnapshot> {
        self.snapshot.load_full()
    }

    /// Registers a change listener.
    pub fn add_listener(&self, listener: Arc<dyn OriginsChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Replaces the configured origin set, diffing against the current one.
    ///
    /// Added origins get a fresh host (pool and client) and start monitored;
    /// removed origins stop being monitored and their clients are closed. An
    /// origin whose attributes changed counts as removed-then-added.
    pub fn set_origins(&self, origins: Vec<Origin>) -> OriginsDiff {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut diff = OriginsDiff::default();

        let incoming: HashMap<OriginId, Origin> = origins
            .into_iter()
            .map(|o| (o.id().clone(), o.with_application(self.app_id.clone())))
            .collect();

        let current_ids: Vec<OriginId> = registry.keys().cloned().collect();
        for id in current_ids {
            let keep = incoming.get(&id).is_some_and(|incoming_origin| {
                let existing = &registry[&id];
                existing.origin.host() == incoming_origin.host()
                    && existing.origin.port() == incoming_origin.port()
                    && existing.origin.tls() == incoming_origin.tls()
            });
            if !keep {
                if let Some(entry) = registry.remove(&id) {
                    self.monitor.stop_monitoring(std::slice::from_ref(&entry.origin));
                    entry.host.client().close();
                }
                diff.removed.push(id);
            }
        }

        let mut newly_monitored = Vec::new();
        for (id, origin) in incoming {
            if registry.contains_key(&id) {
                diff.unchanged.push(id);
                continue;
            }
            let origin = Arc::new(origin);
            let host = self.host_factory.create(&origin);
            registry.insert(
                id.clone(),
                MonitoredOrigin {
                    origin: origin.clone(),
                    host,
                    state: OriginState::Active,
                },
            );
            newly_monitored.push((*origin).clone());
            diff.added.push(id);
        }
        if !newly_monitored.is_empty() {
            self.monitor.monitor(newly_monitored);
        }

        info!(
            app = %self.app_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "origins reconfigured"
        );
        self.publish_and_notify(&registry);
        diff
    }

    /// Administratively re-enables an origin. Reflected in the next snapshot
    /// and hence the next load-balancer selection. Unknown ids are ignored.
    pub fn enable_origin(&self, origin_id: &OriginId) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = registry.get_mut(origin_id) else {
            return;
        };
        if entry.state != OriginState::Disabled {
            return;
        }
        entry.state = OriginState::Active;
        let origin = (*entry.origin).clone();
        info!(app = %self.app_id, origin = %origin_id, "origin enabled");
        self.monitor.monitor(vec![origin]);
        self.publish_and_notify(&registry);
    }

    /// Administratively disables an origin: removed from the active set and
    /// from health monitoring until re-enabled. Unknown ids are ignored.
    pub fn disable_origin(&self, origin_id: &OriginId) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = registry.get_mut(origin_id) else {
            return;
        };
        if entry.state == OriginState::Disabled {
            return;
        }
        entry.state = OriginState::Disabled;
        let origin = entry.origin.clone();
        info!(app = %self.app_id, origin = %origin_id, "origin disabled");
        self.monitor.stop_monitoring(std::slice::from_ref(&origin));
        self.publish_and_notify(&registry);
    }

    /// Shuts the inventory down: stops monitoring and closes every client.
    pub fn close(&self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for entry in registry.values() {
            self.monitor.stop_monitoring(std::slice::from_ref(&entry.origin));
            entry.host.client().close();
        }
        registry.clear();
        self.publish_and_notify(&registry);
    }

    fn set_state(&self, origin: &Origin, from: OriginState, to: OriginState) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = registry.get_mut(origin.id()) else {
            return;
        };
        if entry.state != from {
            return;
        }
        entry.state = to;
        debug!(app = %self.app_id, origin = %origin.id(), ?from, ?to, "origin state changed");
        self.publish_and_notify(&registry);
    }

    /// Builds and stores a fresh snapshot, then notifies listeners. Runs with
    /// the registry lock held so listeners observe mutations in order.
    fn publish_and_notify(&self, registry: &HashMap<OriginId, MonitoredOrigin>) {
        let mut snapshot = OriginsSnapshot::empty(self.app_id.clone());
        for entry in registry.values() {
            match entry.state {
                OriginState::Active => snapshot.active.push(entry.host.clone()),
                OriginState::Inactive => snapshot.inactive.push(entry.origin.clone()),
                OriginState::Disabled => snapshot.disabled.push(entry.origin.clone()),
            }
        }
        snapshot.active.sort_by(|a, b| a.origin().cmp(b.origin()));

        let snapshot = Arc::new(snapshot);
        self.snapshot.store(snapshot.clone());

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.origins_changed(&snapshot);
        }
    }
}

impl ActiveOrigins for OriginsInventory {
    fn active_hosts(&self) -> Vec<RemoteHost> {
        self.snapshot.load().active().to_vec()
    }

    fn app_id(&self) -> AppId {
        self.app_id.clone()
    }
}

impl HealthEventListener for OriginsInventory {
    fn origin_healthy(&self, origin: &Origin) {
        self.set_state(origin, OriginState::Inactive, OriginState::Active);
    }

    fn origin_unhealthy(&self, origin: &Origin) {
        self.set_state(origin, OriginState::Active, OriginState::Inactive);
    }

    fn monitoring_ended(&self, origin: &Origin) {
        debug!(app = %self.app_id, origin = %origin.id(), "monitoring ended");
    }
}

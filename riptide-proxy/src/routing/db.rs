//! The concurrent route database.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use dashmap::DashMap;
use tracing::debug;

use super::{
    RouteChangeListener, RoutingError, RoutingObject, RoutingObjectDefinition,
    RoutingObjectFactory,
};

/// One stored node: its definition plus the lazily built handler.
///
/// The handler cell is shared out of the map so a build can run without
/// holding the map entry. A racing first build loses the `set` and discards
/// its instance; every reader then sees the single cached winner.
struct RouteRecord {
    definition: Arc<RoutingObjectDefinition>,
    handler: Arc<OnceLock<Arc<dyn RoutingObject>>>,
}

/// A concurrent name-to-routing-object map with lazy builds, tag queries and
/// synchronous change notification.
pub struct RouteDatabase {
    records: DashMap<String, RouteRecord>,
    factories: DashMap<String, Arc<dyn RoutingObjectFactory>>,
    listeners: Mutex<Vec<Arc<dyn RouteChangeListener>>>,
    // Handed to factories so built objects can reference siblings by name.
    self_ref: Weak<RouteDatabase>,
}

impl RouteDatabase {
    /// Creates an empty database with no registered factories.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            records: DashMap::new(),
            factories: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Registers the factory used to build objects of `object_type`.
    pub fn add_factory(&self, object_type: impl Into<String>, factory: Arc<dyn RoutingObjectFactory>) {
        self.factories.insert(object_type.into(), factory);
    }

    /// Upserts a definition under its name.
    ///
    /// Any previously built handler for that name is invalidated; the next
    /// lookup rebuilds from the new definition.
    pub fn insert(&self, definition: RoutingObjectDefinition) {
        let name = definition.name().to_owned();
        debug!(node = %name, object_type = %definition.object_type(), "route inserted");
        self.records.insert(
            name,
            RouteRecord {
                definition: Arc::new(definition),
                handler: Arc::new(OnceLock::new()),
            },
        );
        self.notify();
    }

    /// Evicts a node. Returns false when the name was absent, in which case
    /// listeners are not notified.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.records.remove(name).is_some();
        if removed {
            debug!(node = %name, "route removed");
            self.notify();
        }
        removed
    }

    /// The stored definition for a name, if any.
    pub fn definition(&self, name: &str) -> Option<Arc<RoutingObjectDefinition>> {
        self.records.get(name).map(|record| record.definition.clone())
    }

    /// Returns the handler for a name, building it on first access.
    ///
    /// Unknown names yield `Ok(None)`. Concurrent first lookups may both run
    /// the factory; exactly one result is cached and the loser is discarded.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<dyn RoutingObject>>, RoutingError> {
        let (definition, cell) = match self.records.get(name) {
            Some(record) => (record.definition.clone(), record.handler.clone()),
            None => return Ok(None),
        };
        if let Some(handler) = cell.get() {
            return Ok(Some(handler.clone()));
        }
        // The map entry is released before the factory runs so that a build
        // consulting the database cannot deadlock against its own entry.
        let factory = self
            .factories
            .get(definition.object_type())
            .map(|factory| factory.clone())
            .ok_or_else(|| RoutingError::UnknownType(definition.object_type().to_owned()))?;
        let this = match self.self_ref.upgrade() {
            Some(this) => this,
            // Only reachable while the owning Arc is being dropped.
            None => return Ok(None),
        };
        let built = factory.build(name, &this, &definition)?;
        let _ = cell.set(built);
        Ok(cell.get().cloned())
    }

    /// Every node whose tag set is a superset of `tags`, building any
    /// not-yet-built matches. Results are ordered by name.
    pub fn tag_lookup(
        &self,
        tags: &[&str],
    ) -> Result<Vec<(String, Arc<dyn RoutingObject>)>, RoutingError> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.definition.has_tags(tags.iter().copied()))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        let mut matches = Vec::with_capacity(names.len());
        for name in names {
            if let Some(handler) = self.lookup(&name)? {
                matches.push((name, handler));
            }
        }
        Ok(matches)
    }

    /// Atomically rewrites one tag on one node, keeping any built handler.
    ///
    /// An absent name, or a name without the `old` tag, is a no-op and does
    /// not notify listeners.
    pub fn replace_tag(&self, name: &str, old: &str, new: &str) -> bool {
        let changed = match self.records.get_mut(name) {
            Some(mut record) => {
                let mut definition = (*record.definition).clone();
                if definition.retag(old, new) {
                    record.definition = Arc::new(definition);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if changed {
            debug!(node = %name, old, new, "route retagged");
            self.notify();
        }
        changed
    }

    /// Registers a listener for topology changes.
    pub fn add_listener(&self, listener: Arc<dyn RouteChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn RouteChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Notifies listeners in registration order, after the mutation is
    /// visible to lookups.
    fn notify(&self) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.route_database_changed();
        }
    }
}

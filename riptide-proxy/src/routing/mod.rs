//! The routing object graph: named, lazily built request handlers.
//!
//! Handlers are declared as [`RoutingObjectDefinition`]s and stored in a
//! [`RouteDatabase`]. A definition gains a live handler only on first lookup;
//! definitions may reference each other by name, including cyclically, because
//! references resolve through the database at dispatch time.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use riptide_core::errors::DispatchError;
use riptide_core::http::{HttpRequest, HttpResponse};

mod builtins;
mod db;

pub use builtins::{
    LoadBalancingGroupFactory, PathPrefixRouterFactory, StaticResponseFactory,
};
pub use db::RouteDatabase;

/// The result of dispatching one request into a routing object.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HttpResponse, DispatchError>> + Send>>;

/// A built node in the routing graph.
pub trait RoutingObject: Send + Sync {
    /// Handles one request, possibly routing it into sibling nodes.
    fn handle(&self, request: HttpRequest) -> HandlerFuture;
}

/// Builds handlers for one routing object type.
///
/// The factory receives the database so a definition can reference sibling
/// nodes by name. Implementations must not build siblings eagerly; cyclic
/// definitions terminate only because references resolve lazily at dispatch.
pub trait RoutingObjectFactory: Send + Sync {
    /// Builds the handler for one definition.
    fn build(
        &self,
        name: &str,
        database: &Arc<RouteDatabase>,
        definition: &RoutingObjectDefinition,
    ) -> Result<Arc<dyn RoutingObject>, RoutingError>;
}

/// Observes topology changes in a [`RouteDatabase`].
pub trait RouteChangeListener: Send + Sync {
    /// A mutation is now visible to lookups.
    fn route_database_changed(&self);
}

/// A declared but not necessarily built routing object.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingObjectDefinition {
    name: String,
    #[serde(rename = "type")]
    object_type: String,
    #[serde(default)]
    tags: HashSet<String>,
    #[serde(default)]
    config: serde_json::Value,
}

impl RoutingObjectDefinition {
    /// Creates a definition with no tags and a null config.
    pub fn new(name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_type: object_type.into(),
            tags: HashSet::new(),
            config: serde_json::Value::Null,
        }
    }

    /// Replaces the tag set.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the opaque configuration value.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// The unique node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The routing object type, matched against registered factories.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// The unordered tag set.
    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    /// The type-specific configuration.
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Whether the tag set covers every queried tag.
    pub fn has_tags<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> bool {
        tags.into_iter().all(|tag| self.tags.contains(tag))
    }

    /// Rewrites one tag in place. Returns false when `old` was absent.
    pub fn retag(&mut self, old: &str, new: &str) -> bool {
        if self.tags.remove(old) {
            self.tags.insert(new.to_owned());
            true
        } else {
            false
        }
    }
}

/// A failure to build a routing object from its definition.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// No factory is registered for the definition's type.
    #[error("unknown routing object type `{0}`")]
    UnknownType(String),
    /// The definition's configuration did not parse for its type.
    #[error("invalid configuration for routing object `{name}`: {message}")]
    InvalidConfig {
        /// The node whose configuration was rejected.
        name: String,
        /// What was wrong with it.
        message: String,
    },
}

impl RoutingError {
    pub(crate) fn invalid_config(name: &str, message: impl ToString) -> Self {
        RoutingError::InvalidConfig {
            name: name.to_owned(),
            message: message.to_string(),
        }
    }
}

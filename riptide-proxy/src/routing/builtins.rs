//! Built-in routing object types.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use http::{header, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use riptide_core::errors::DispatchError;
use riptide_core::http::{HttpRequest, HttpResponse};

use super::{
    HandlerFuture, RouteDatabase, RoutingError, RoutingObject, RoutingObjectDefinition,
    RoutingObjectFactory,
};
use crate::dispatch::BackendServiceClient;

fn not_found() -> HttpResponse {
    let mut response = Response::new(Bytes::from_static(b"Not Found"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

#[derive(Debug, Error)]
#[error("routing destination `{0}` does not exist")]
struct MissingDestination(String);

#[derive(Debug, Error)]
#[error("route database was dropped")]
struct DatabaseGone;

/// Resolves a destination name through the database at dispatch time. Name
/// resolution here, not at build time, is what makes cyclic graphs safe.
fn dispatch_to(
    database: &Weak<RouteDatabase>,
    attributed_to: &str,
    destination: &str,
    request: HttpRequest,
) -> HandlerFuture {
    let handler = match database.upgrade() {
        Some(database) => database
            .lookup(destination)
            .map_err(|error| DispatchError::plugin(attributed_to, error))
            .and_then(|handler| {
                handler.ok_or_else(|| {
                    DispatchError::plugin(attributed_to, MissingDestination(destination.to_owned()))
                })
            }),
        None => Err(DispatchError::plugin(attributed_to, DatabaseGone)),
    };
    match handler {
        Ok(handler) => handler.handle(request),
        Err(error) => Box::pin(async move { Err(error) }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticResponseConfig {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    content: String,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
}

fn default_status() -> u16 {
    200
}

struct StaticResponse {
    status: StatusCode,
    content: Bytes,
    content_type: Option<String>,
}

impl RoutingObject for StaticResponse {
    fn handle(&self, _request: HttpRequest) -> HandlerFuture {
        let mut response = Response::new(self.content.clone());
        *response.status_mut() = self.status;
        if let Some(content_type) = &self.content_type {
            if let Ok(value) = header::HeaderValue::from_str(content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
        }
        Box::pin(async move { Ok(response) })
    }
}

/// Builds `StaticResponse` nodes: a fixed status and body, no onward routing.
#[derive(Debug, Default)]
pub struct StaticResponseFactory;

impl RoutingObjectFactory for StaticResponseFactory {
    fn build(
        &self,
        name: &str,
        _database: &Arc<RouteDatabase>,
        definition: &RoutingObjectDefinition,
    ) -> Result<Arc<dyn RoutingObject>, RoutingError> {
        let config: StaticResponseConfig = serde_json::from_value(definition.config().clone())
            .map_err(|error| RoutingError::invalid_config(name, error))?;
        let status = StatusCode::from_u16(config.status)
            .map_err(|error| RoutingError::invalid_config(name, error))?;
        Ok(Arc::new(StaticResponse {
            status,
            content: Bytes::from(config.content),
            content_type: config.content_type,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathPrefixRouterConfig {
    routes: Vec<PrefixRoute>,
    fallback: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PrefixRoute {
    prefix: String,
    destination: String,
}

/// Routes by longest matching path prefix to named sibling nodes.
struct PathPrefixRouter {
    name: String,
    // Longest prefix first, so the first match wins.
    routes: Vec<(String, String)>,
    fallback: Option<String>,
    database: Weak<RouteDatabase>,
}

impl RoutingObject for PathPrefixRouter {
    fn handle(&self, request: HttpRequest) -> HandlerFuture {
        let path = request.uri().path();
        let destination = self
            .routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, destination)| destination)
            .or(self.fallback.as_ref());
        match destination {
            Some(destination) => dispatch_to(&self.database, &self.name, destination, request),
            None => Box::pin(async move { Ok(not_found()) }),
        }
    }
}

/// Builds `PathPrefixRouter` nodes from a list of prefix-to-destination
/// routes and an optional fallback destination.
#[derive(Debug, Default)]
pub struct PathPrefixRouterFactory;

impl RoutingObjectFactory for PathPrefixRouterFactory {
    fn build(
        &self,
        name: &str,
        database: &Arc<RouteDatabase>,
        definition: &RoutingObjectDefinition,
    ) -> Result<Arc<dyn RoutingObject>, RoutingError> {
        let config: PathPrefixRouterConfig = serde_json::from_value(definition.config().clone())
            .map_err(|error| RoutingError::invalid_config(name, error))?;
        let mut routes: Vec<(String, String)> = config
            .routes
            .into_iter()
            .map(|route| (route.prefix, route.destination))
            .collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(Arc::new(PathPrefixRouter {
            name: name.to_owned(),
            routes,
            fallback: config.fallback,
            database: Arc::downgrade(database),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadBalancingGroupConfig {
    backend: String,
}

struct LoadBalancingGroup {
    client: Arc<BackendServiceClient>,
}

impl RoutingObject for LoadBalancingGroup {
    fn handle(&self, request: HttpRequest) -> HandlerFuture {
        let client = self.client.clone();
        Box::pin(async move { client.send(request).await })
    }
}

/// Builds `LoadBalancingGroup` nodes that dispatch into a backend service
/// client registered under the configured backend id.
#[derive(Default)]
pub struct LoadBalancingGroupFactory {
    clients: DashMap<String, Arc<BackendServiceClient>>,
}

impl LoadBalancingGroupFactory {
    /// Creates a factory with an empty client registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client serving one backend id.
    pub fn register(&self, backend: impl Into<String>, client: Arc<BackendServiceClient>) {
        self.clients.insert(backend.into(), client);
    }
}

impl RoutingObjectFactory for LoadBalancingGroupFactory {
    fn build(
        &self,
        name: &str,
        _database: &Arc<RouteDatabase>,
        definition: &RoutingObjectDefinition,
    ) -> Result<Arc<dyn RoutingObject>, RoutingError> {
        let config: LoadBalancingGroupConfig = serde_json::from_value(definition.config().clone())
            .map_err(|error| RoutingError::invalid_config(name, error))?;
        let client = self
            .clients
            .get(&config.backend)
            .map(|client| client.clone())
            .ok_or_else(|| {
                RoutingError::invalid_config(
                    name,
                    format!("no backend registered under `{}`", config.backend),
                )
            })?;
        Ok(Arc::new(LoadBalancingGroup { client }))
    }
}

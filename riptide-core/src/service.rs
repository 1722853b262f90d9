//! Backend service configuration value objects.
//!
//! These are the parsed forms the core consumes; reading them out of YAML or
//! JSON is the configuration source's concern.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ServiceError;
use crate::origin::{AppId, Origin};

/// Connection pool limits applied to every origin of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    /// Maximum connections the pool will open to one origin.
    pub max_connections_per_host: usize,
    /// Maximum acquisitions allowed to queue once the pool is at capacity.
    /// Beyond this the acquisition fails fast.
    pub max_pending_connections_per_host: usize,
    /// Upper bound on connection establishment.
    pub connect_timeout_millis: u64,
    /// Upper bound on time spent waiting in the pending queue.
    pub pending_connection_timeout_millis: u64,
    /// Idle connections older than this are closed instead of reused.
    pub connection_expiration_seconds: u64,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_connections_per_host: 50,
            max_pending_connections_per_host: 25,
            connect_timeout_millis: 1_000,
            pending_connection_timeout_millis: 8_000,
            connection_expiration_seconds: 0,
        }
    }
}

impl ConnectionPoolSettings {
    /// The connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    /// The pending-queue wait bound as a [`Duration`].
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_connection_timeout_millis)
    }

    /// Idle expiration as a [`Duration`], `None` when disabled.
    pub fn connection_expiration(&self) -> Option<Duration> {
        (self.connection_expiration_seconds > 0)
            .then(|| Duration::from_secs(self.connection_expiration_seconds))
    }
}

/// Extra limits for an HTTP/2-capable pool, which multiplexes logical
/// streams over a small number of live connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Http2PoolSettings {
    /// Most live connections the pool will hold to one origin.
    pub max_connections: usize,
    /// Connections kept open even when idle.
    pub min_connections: usize,
    /// Concurrent logical streams allowed per connection.
    pub max_streams_per_connection: usize,
    /// Stream acquisitions allowed to queue per host before failing fast.
    pub max_pending_streams_per_host: usize,
}

impl Default for Http2PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            min_connections: 1,
            max_streams_per_connection: 100,
            max_pending_streams_per_host: 200,
        }
    }
}

/// Health-check configuration for the origins of one backend service.
///
/// Monitoring is enabled exactly when a probe URI is configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe URI, e.g. `/admin/healthcheck`. Absent means monitoring is off.
    #[serde(default)]
    pub uri: Option<String>,
    /// Period between scheduled checks.
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u64,
    /// Upper bound on one probe; exceeding it counts as unhealthy.
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
    /// Consecutive healthy probes required before reporting recovery.
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive unhealthy probes required before reporting failure.
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_interval_millis() -> u64 {
    5_000
}

fn default_timeout_millis() -> u64 {
    2_000
}

fn default_threshold() -> u32 {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            uri: None,
            interval_millis: default_interval_millis(),
            timeout_millis: default_timeout_millis(),
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
        }
    }
}

impl HealthCheckConfig {
    /// Whether monitoring is enabled for the service's origins.
    pub fn is_enabled(&self) -> bool {
        self.uri.is_some()
    }

    /// The probe period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    /// The per-probe timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

/// Sticky-session configuration: pinning a client to one origin via a cookie.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StickySessionConfig {
    /// Whether responses carry the sticky-session cookie.
    pub enabled: bool,
    /// Cookie Max-Age in seconds.
    pub timeout_seconds: u64,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: 43_200,
        }
    }
}

/// A path rewrite applied to requests before they are forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    /// Path prefix the rule matches on.
    pub url_pattern: String,
    /// Replacement for the matched prefix.
    pub replacement: String,
}

impl RewriteRule {
    /// Applies the rule, returning the rewritten path when it matches.
    pub fn apply(&self, path: &str) -> Option<String> {
        path.strip_prefix(&self.url_pattern)
            .map(|rest| format!("{}{}", self.replacement, rest))
    }
}

/// An application: a named group of origins sharing routing, pooling and
/// health-check configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendService {
    id: AppId,
    path: String,
    origins: Vec<Origin>,
    connection_pool: ConnectionPoolSettings,
    health_check: HealthCheckConfig,
    sticky_session: StickySessionConfig,
    response_timeout_millis: u64,
    rewrites: Vec<RewriteRule>,
}

impl BackendService {
    /// Starts building a backend service.
    pub fn builder(id: impl Into<AppId>) -> BackendServiceBuilder {
        BackendServiceBuilder {
            id: id.into(),
            path: "/".to_string(),
            origins: Vec::new(),
            connection_pool: ConnectionPoolSettings::default(),
            health_check: HealthCheckConfig::default(),
            sticky_session: StickySessionConfig::default(),
            response_timeout_millis: 60_000,
            rewrites: Vec::new(),
        }
    }

    /// The application id.
    pub fn id(&self) -> &AppId {
        &self.id
    }

    /// The path prefix this service is mounted on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The configured origins. Each carries this service's id as its
    /// application, regardless of what the definition said.
    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    /// Connection pool limits for each origin.
    pub fn connection_pool_settings(&self) -> &ConnectionPoolSettings {
        &self.connection_pool
    }

    /// Health-check configuration.
    pub fn health_check_config(&self) -> &HealthCheckConfig {
        &self.health_check
    }

    /// Sticky-session configuration.
    pub fn sticky_session_config(&self) -> &StickySessionConfig {
        &self.sticky_session
    }

    /// Upper bound on waiting for a response from an origin.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_millis)
    }

    /// Path rewrite rules, applied in order, first match wins.
    pub fn rewrites(&self) -> &[RewriteRule] {
        &self.rewrites
    }

    /// Rebuilds this service with a different set of origins.
    pub fn with_origins(&self, origins: Vec<Origin>) -> Result<BackendService, ServiceError> {
        BackendServiceBuilder {
            id: self.id.clone(),
            path: self.path.clone(),
            origins,
            connection_pool: self.connection_pool.clone(),
            health_check: self.health_check.clone(),
            sticky_session: self.sticky_session.clone(),
            response_timeout_millis: self.response_timeout_millis,
            rewrites: self.rewrites.clone(),
        }
        .build()
    }
}

/// Builder for [`BackendService`], enforcing the per-application origin
/// uniqueness invariants at construction time.
#[derive(Debug)]
pub struct BackendServiceBuilder {
    id: AppId,
    path: String,
    origins: Vec<Origin>,
    connection_pool: ConnectionPoolSettings,
    health_check: HealthCheckConfig,
    sticky_session: StickySessionConfig,
    response_timeout_millis: u64,
    rewrites: Vec<RewriteRule>,
}

impl BackendServiceBuilder {
    /// Sets the path prefix.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the origin set.
    pub fn origins(mut self, origins: Vec<Origin>) -> Self {
        self.origins = origins;
        self
    }

    /// Sets the pool limits.
    pub fn connection_pool_settings(mut self, settings: ConnectionPoolSettings) -> Self {
        self.connection_pool = settings;
        self
    }

    /// Sets the health-check configuration.
    pub fn health_check_config(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = config;
        self
    }

    /// Sets the sticky-session configuration.
    pub fn sticky_session_config(mut self, config: StickySessionConfig) -> Self {
        self.sticky_session = config;
        self
    }

    /// Sets the response timeout in milliseconds.
    pub fn response_timeout_millis(mut self, millis: u64) -> Self {
        self.response_timeout_millis = millis;
        self
    }

    /// Sets the rewrite rules.
    pub fn rewrites(mut self, rewrites: Vec<RewriteRule>) -> Self {
        self.rewrites = rewrites;
        self
    }

    /// Builds the service. Fails when two origins share an id or a
    /// (host, port) pair within this application.
    pub fn build(self) -> Result<BackendService, ServiceError> {
        let mut seen_ids = HashSet::new();
        let mut seen_addrs = HashSet::new();
        let origins: Vec<Origin> = self
            .origins
            .into_iter()
            .map(|o| o.with_application(self.id.clone()))
            .collect();

        for origin in &origins {
            if !seen_ids.insert(origin.id().clone()) {
                return Err(ServiceError::DuplicateOriginId {
                    app: self.id,
                    origin: origin.id().clone(),
                });
            }
            if !seen_addrs.insert((origin.host().to_string(), origin.port())) {
                return Err(ServiceError::DuplicateOriginAddress {
                    app: self.id,
                    host: origin.host().to_string(),
                    port: origin.port(),
                });
            }
        }

        Ok(BackendService {
            id: self.id,
            path: self.path,
            origins,
            connection_pool: self.connection_pool,
            health_check: self.health_check,
            sticky_session: self.sticky_session,
            response_timeout_millis: self.response_timeout_millis,
            rewrites: self.rewrites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use proptest::prelude::*;

    fn origin(app: &str, id: &str, host: &str, port: u16) -> Origin {
        Origin::builder(app, id).host(host).port(port).build().unwrap()
    }

    #[test]
    fn duplicate_origin_id_fails_construction() {
        let result = BackendService::builder("webapp")
            .origins(vec![
                origin("webapp", "o1", "host-a", 8080),
                origin("webapp", "o1", "host-b", 8081),
            ])
            .build();
        assert!(matches!(result, Err(ServiceError::DuplicateOriginId { .. })));
    }

    #[test]
    fn duplicate_host_port_fails_construction() {
        let result = BackendService::builder("webapp")
            .origins(vec![
                origin("webapp", "o1", "host-a", 8080),
                origin("webapp", "o2", "host-a", 8080),
            ])
            .build();
        assert!(matches!(
            result,
            Err(ServiceError::DuplicateOriginAddress { .. })
        ));
    }

    #[test]
    fn origin_application_is_derived_from_service_id() {
        let service = BackendService::builder("webapp")
            .origins(vec![origin("something-else", "o1", "host-a", 8080)])
            .build()
            .unwrap();
        assert_eq!(service.origins()[0].application().as_str(), "webapp");
    }

    #[test]
    fn health_check_enabled_iff_uri_present() {
        let mut config = HealthCheckConfig::default();
        assert!(!config.is_enabled());
        config.uri = Some("/health".to_string());
        assert!(config.is_enabled());
    }

    #[test]
    fn rewrite_applies_on_prefix_match_only() {
        let rule = RewriteRule {
            url_pattern: "/shop/".to_string(),
            replacement: "/".to_string(),
        };
        assert_eq!(rule.apply("/shop/cart"), Some("/cart".to_string()));
        assert_eq!(rule.apply("/other/cart"), None);
    }

    proptest! {
        #[test]
        fn distinct_ids_and_addresses_always_build(count in 1usize..20) {
            let origins: Vec<Origin> = (0..count)
                .map(|i| origin("webapp", &format!("o{i}"), &format!("host-{i}"), 8000 + i as u16))
                .collect();
            let service = BackendService::builder("webapp").origins(origins).build();
            prop_assert!(service.is_ok());
            prop_assert_eq!(service.unwrap().origins().len(), count);
        }
    }
}

//! Riptide proxy engine entrypoint.
//!
//! Assembles the full request path for one application: origin inventory,
//! health monitoring, load balancing, retry policy, routing graph and the
//! listener, then serves until failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use riptide_core::health::{AnomalyExcludingMonitor, HealthStatusMonitor, NoHealthStatusMonitor};
use riptide_core::inventory::OriginsInventory;
use riptide_core::load_balancer::busy::BusyActivitiesStrategy;
use riptide_core::load_balancer::sticky::StickySessionStrategy;
use riptide_core::load_balancer::LoadBalancer;
use riptide_core::retry::RetryNTimes;
use riptide_core::{BackendService, Origin};

use riptide_proxy::dispatch::{BackendServiceClient, PooledHostFactory};
use riptide_proxy::health_check::{HttpProbe, ScheduledHealthMonitor};
use riptide_proxy::metrics::InProcessMetrics;
use riptide_proxy::routing::{
    LoadBalancingGroupFactory, PathPrefixRouterFactory, RouteDatabase, RoutingObjectDefinition,
    StaticResponseFactory,
};
use riptide_proxy::server::start_server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let service = BackendService::builder("webapp")
        .path("/")
        .origins(vec![
            Origin::builder("webapp", "origin-1")
                .host("127.0.0.1")
                .port(9091)
                .build()?,
            Origin::builder("webapp", "origin-2")
                .host("127.0.0.1")
                .port(9092)
                .build()?,
        ])
        .build()?;

    let metrics = Arc::new(InProcessMetrics::new());

    let health = service.health_check_config().clone();
    let monitor: Arc<dyn HealthStatusMonitor> = match &health.uri {
        Some(uri) => {
            let scheduled = ScheduledHealthMonitor::start(
                Arc::new(HttpProbe::new(uri.clone())),
                health.interval(),
                health.timeout(),
                metrics.clone(),
            );
            Arc::new(AnomalyExcludingMonitor::new(
                scheduled,
                health.healthy_threshold,
                health.unhealthy_threshold,
            )?)
        }
        None => Arc::new(NoHealthStatusMonitor),
    };

    let host_factory = Arc::new(PooledHostFactory::new(
        service.connection_pool_settings().clone(),
    ));
    let inventory = OriginsInventory::new(service.id().clone(), monitor, host_factory.clone());
    inventory.set_origins(service.origins().to_vec());

    let strategy: Arc<dyn LoadBalancer> = Arc::new(BusyActivitiesStrategy::new(inventory.clone()));
    let strategy: Arc<dyn LoadBalancer> = if service.sticky_session_config().enabled {
        Arc::new(StickySessionStrategy::new(strategy))
    } else {
        strategy
    };

    let client = BackendServiceClient::new(
        service.clone(),
        strategy,
        Arc::new(RetryNTimes::with_interval(2, Duration::from_millis(100))),
        metrics,
    );

    let database = RouteDatabase::new();
    database.add_factory("StaticResponse", Arc::new(StaticResponseFactory));
    database.add_factory("PathPrefixRouter", Arc::new(PathPrefixRouterFactory));
    let groups = LoadBalancingGroupFactory::new();
    groups.register(service.id().as_str(), client);
    database.add_factory("LoadBalancingGroup", Arc::new(groups));

    database.insert(
        RoutingObjectDefinition::new("webapp", "LoadBalancingGroup")
            .with_tags(["backend"])
            .with_config(json!({ "backend": "webapp" })),
    );
    database.insert(
        RoutingObjectDefinition::new("root", "PathPrefixRouter").with_config(json!({
            "routes": [{ "prefix": service.path(), "destination": "webapp" }],
            "fallback": null
        })),
    );

    // Reap expired idle connections in the background.
    tokio::spawn({
        let host_factory = host_factory.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                host_factory.sweep_idle();
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(app = %service.id(), "starting riptide");
    start_server(addr, None, database, "root").await
}

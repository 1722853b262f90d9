//! Pool-backed host clients and the factory that assembles remote hosts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use riptide_core::errors::TransportError;
use riptide_core::http::{HttpRequest, HttpResponse, SendFuture};
use riptide_core::load_balancer::metric::PeakEwma;
use riptide_core::origin::{Origin, OriginId};
use riptide_core::remote_host::{HostClient, RemoteHost, RemoteHostFactory};
use riptide_core::service::ConnectionPoolSettings;

use crate::connection_pool::{
    ConnectionFactory, HostConnectionPool, HttpConnection, HttpConnectionFactory,
};

fn send_on<'a>(
    conn: &'a mut HttpConnection,
    request: HttpRequest,
) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
    Box::pin(conn.send(request))
}

/// A [`HostClient`] that borrows connections from one origin's pool.
pub struct PooledHostClient {
    pool: Arc<HostConnectionPool<HttpConnection>>,
}

impl PooledHostClient {
    /// Wraps a pool as a host client.
    pub fn new(pool: Arc<HostConnectionPool<HttpConnection>>) -> Self {
        Self { pool }
    }
}

impl HostClient for PooledHostClient {
    fn send(&self, request: HttpRequest) -> SendFuture {
        let pool = self.pool.clone();
        Box::pin(async move {
            pool.with_connection(move |conn| send_on(conn, request))
                .await
        })
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// Builds pool-backed remote hosts for one application's origins.
///
/// Keeps a registry of live pools so the engine can sweep idle connections;
/// pools closed by the inventory drop out on the next sweep.
pub struct PooledHostFactory {
    settings: ConnectionPoolSettings,
    connections: Arc<dyn ConnectionFactory<HttpConnection>>,
    pools: DashMap<OriginId, Arc<HostConnectionPool<HttpConnection>>>,
}

impl PooledHostFactory {
    /// Creates a factory using direct TCP/TLS origin connections.
    pub fn new(settings: ConnectionPoolSettings) -> Self {
        Self::with_connections(settings, Arc::new(HttpConnectionFactory))
    }

    /// Creates a factory with a custom connection source.
    pub fn with_connections(
        settings: ConnectionPoolSettings,
        connections: Arc<dyn ConnectionFactory<HttpConnection>>,
    ) -> Self {
        Self {
            settings,
            connections,
            pools: DashMap::new(),
        }
    }

    /// The live pool for an origin, if one exists.
    pub fn pool(&self, origin: &OriginId) -> Option<Arc<HostConnectionPool<HttpConnection>>> {
        self.pools.get(origin).map(|pool| pool.clone())
    }

    /// Reaps expired idle connections in every live pool and forgets pools
    /// that have been closed.
    pub fn sweep_idle(&self) {
        self.pools.retain(|_, pool| {
            if pool.is_closed() {
                return false;
            }
            pool.sweep_idle();
            true
        });
    }
}

impl RemoteHostFactory for PooledHostFactory {
    fn create(&self, origin: &Origin) -> RemoteHost {
        let origin = Arc::new(origin.clone());
        let pool = HostConnectionPool::new(
            origin.clone(),
            self.settings.clone(),
            self.connections.clone(),
        );
        self.pools.insert(origin.id().clone(), pool.clone());
        RemoteHost::new(
            origin,
            Arc::new(PooledHostClient::new(pool)),
            Arc::new(PeakEwma::default()),
        )
    }
}

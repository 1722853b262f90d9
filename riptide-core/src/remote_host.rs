//! The selectable unit handed to load balancers and the dispatch pipeline.

use std::fmt;
use std::sync::Arc;

use crate::http::{HttpRequest, SendFuture};
use crate::load_balancer::metric::LoadBalancingMetric;
use crate::origin::Origin;

/// A transport client bound to one origin.
///
/// The engine supplies an implementation backed by the origin's connection
/// pool; the core only needs the send/close seam.
pub trait HostClient: Send + Sync {
    /// Sends one request to the origin this client is bound to.
    fn send(&self, request: HttpRequest) -> SendFuture;

    /// Releases the client's resources. Called when the origin leaves the
    /// active configuration.
    fn close(&self);
}

/// Creates the per-origin client and load metric when an origin enters the
/// active configuration.
pub trait RemoteHostFactory: Send + Sync {
    /// Builds a [`RemoteHost`] for a newly configured origin.
    fn create(&self, origin: &Origin) -> RemoteHost;
}

/// The selectable unit: an origin, its transport client (wrapping the
/// origin's connection pool) and its load-balancing metric.
///
/// Lifetime is tied to the origin's presence in the active snapshot.
#[derive(Clone)]
pub struct RemoteHost {
    origin: Arc<Origin>,
    client: Arc<dyn HostClient>,
    metric: Arc<dyn LoadBalancingMetric>,
}

impl RemoteHost {
    /// Assembles a remote host.
    pub fn new(
        origin: Arc<Origin>,
        client: Arc<dyn HostClient>,
        metric: Arc<dyn LoadBalancingMetric>,
    ) -> Self {
        Self {
            origin,
            client,
            metric,
        }
    }

    /// The origin this host represents.
    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    /// The transport client for this origin.
    pub fn client(&self) -> &Arc<dyn HostClient> {
        &self.client
    }

    /// The load metric strategies read (outstanding requests, latency signal).
    pub fn metric(&self) -> &Arc<dyn LoadBalancingMetric> {
        &self.metric
    }
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("origin", &self.origin)
            .field("ongoing", &self.metric.ongoing_activities())
            .finish()
    }
}

//! Per-origin connection pooling.
//!
//! Pool state is scoped to one origin; there is no cross-origin locking.
//! The HTTP/1 pool hands out exclusive connections; the HTTP/2 pool hands
//! out logical streams multiplexed over a few live connections.

mod http2;
mod http_connection;
mod pool;

pub use http2::{Http2ConnectionPool, StreamGuard};
pub use http_connection::{HttpConnection, HttpConnectionFactory};
pub use pool::{CheckedOut, ConnectFuture, ConnectionFactory, HostConnectionPool, PoolStats, PoolableConnection};

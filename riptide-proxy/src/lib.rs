//! The Riptide dispatch engine.
//!
//! Everything request-path: per-origin connection pools, active health
//! checking, the routing object graph, the retrying backend service client
//! and the listener that ties them together. The origin model, selection
//! strategies and retry policies live in `riptide-core`.

pub mod connection_pool;
pub mod dispatch;
pub mod health_check;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod tls;

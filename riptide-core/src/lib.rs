//! Riptide core: the origin selection and resilience layer.
//!
//! This crate holds the domain model (origins and backend services), the
//! origins inventory with its point-in-time snapshots, health-monitoring
//! contracts with anomaly suppression, load-balancing strategies including
//! sticky sessions, and the retry policy. The async engine that drives
//! them lives in `riptide-proxy`.

pub mod errors;
pub mod health;
pub mod http;
pub mod inventory;
pub mod load_balancer;
pub mod origin;
pub mod remote_host;
pub mod retry;
pub mod service;

pub use errors::{DispatchError, ServiceError, TransportError, TransportErrorKind};
pub use origin::{AppId, Origin, OriginId};
pub use remote_host::RemoteHost;
pub use service::BackendService;

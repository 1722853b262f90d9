//! Active health checking: probe functions and the probe scheduler.

mod monitor;
mod probe;

pub use monitor::ScheduledHealthMonitor;
pub use probe::{HealthCheckFunction, HttpProbe, ProbeFuture, TcpProbe};

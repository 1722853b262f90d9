//! Request dispatch: pooled host clients and the retrying service client.

mod client;
mod host_client;

pub use client::BackendServiceClient;
pub use host_client::{PooledHostClient, PooledHostFactory};

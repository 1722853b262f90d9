//! Probe functions that decide whether a single origin is reachable.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{header, Method, Request};
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use riptide_core::origin::Origin;

/// The result of one probe attempt. `true` means the origin looked healthy.
pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Issues a single health-check attempt against one origin.
///
/// Probe timeouts are enforced by the caller; implementations only need to
/// report the outcome of a completed attempt.
pub trait HealthCheckFunction: Send + Sync {
    /// Probes the origin once.
    fn check(&self, origin: &Origin) -> ProbeFuture;
}

/// A probe that only requires the origin to accept a TCP connection.
#[derive(Debug, Default)]
pub struct TcpProbe;

impl HealthCheckFunction for TcpProbe {
    fn check(&self, origin: &Origin) -> ProbeFuture {
        let address = (origin.host().to_owned(), origin.port());
        Box::pin(async move { TcpStream::connect(address).await.is_ok() })
    }
}

/// A probe that issues an HTTP/1.1 GET on a fresh connection and requires a
/// non-5xx, non-4xx status.
#[derive(Debug)]
pub struct HttpProbe {
    uri: String,
}

impl HttpProbe {
    /// Creates a probe for the given origin-relative URI, such as
    /// `/admin/healthcheck`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl HealthCheckFunction for HttpProbe {
    fn check(&self, origin: &Origin) -> ProbeFuture {
        let uri = self.uri.clone();
        let host = origin.host().to_owned();
        let port = origin.port();
        let origin_id = origin.id().clone();
        Box::pin(async move {
            let stream = match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => stream,
                Err(error) => {
                    debug!(origin = %origin_id, %error, "health probe connect failed");
                    return false;
                }
            };
            let (mut sender, connection) = match http1::handshake(TokioIo::new(stream)).await {
                Ok(parts) => parts,
                Err(error) => {
                    debug!(origin = %origin_id, %error, "health probe handshake failed");
                    return false;
                }
            };
            tokio::spawn(async move {
                let _ = connection.await;
            });
            let request = Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(header::HOST, format!("{host}:{port}"))
                .body(Full::new(Bytes::new()));
            let request = match request {
                Ok(request) => request,
                Err(_) => return false,
            };
            match sender.send_request(request).await {
                Ok(response) => response.status().is_success() || response.status().is_redirection(),
                Err(error) => {
                    debug!(origin = %origin_id, %error, "health probe request failed");
                    false
                }
            }
        })
    }
}

//! The listener: accepts connections and feeds requests into the routing
//! object graph.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use riptide_core::errors::{DispatchError, TransportErrorKind};

use crate::routing::RouteDatabase;

/// Starts the proxy listener on the given address, dispatching every request
/// into the named root node of the route database.
pub async fn start_server(
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    database: Arc<RouteDatabase>,
    root: impl Into<Arc<str>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let root: Arc<str> = root.into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, root = %root, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let database = database.clone();
        let root = root.clone();

        if let Some(acceptor) = &tls_acceptor {
            let acceptor = acceptor.clone();
            tokio::task::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);
                        let served = http1::Builder::new()
                            .serve_connection(
                                io,
                                service_fn(move |request| {
                                    handle_request(database.clone(), root.clone(), request)
                                }),
                            )
                            .await;
                        if let Err(error) = served {
                            debug!(%peer, %error, "connection ended with an error");
                        }
                    }
                    Err(error) => warn!(%peer, %error, "tls handshake failed"),
                }
            });
        } else {
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let served = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |request| {
                            handle_request(database.clone(), root.clone(), request)
                        }),
                    )
                    .await;
                if let Err(error) = served {
                    debug!(%peer, %error, "connection ended with an error");
                }
            });
        }
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Maps a terminal dispatch failure to a gateway-style status. Internal error
/// detail never reaches the client verbatim.
fn error_response(error: DispatchError) -> Response<Full<Bytes>> {
    match &error {
        DispatchError::NoAvailableHosts(app) => {
            warn!(%app, "no available hosts");
            status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
        DispatchError::Transport(transport) => {
            warn!(app = %transport.app(), origin = %transport.origin(), %error, "dispatch failed");
            match transport.kind() {
                TransportErrorKind::ResponseTimeout | TransportErrorKind::ContentTimeout => {
                    status_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
                }
                _ => status_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
            }
        }
        DispatchError::Plugin { name, .. } => {
            error!(extension = %name, %error, "extension fault");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn handle_request(
    database: Arc<RouteDatabase>,
    root: Arc<str>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = request.into_parts();
    let body = body.collect().await?.to_bytes();
    let request = Request::from_parts(parts, body);

    let handler = match database.lookup(&root) {
        Ok(Some(handler)) => handler,
        Ok(None) => {
            error!(root = %root, "root routing object is not defined");
            return Ok(status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ));
        }
        Err(error) => {
            error!(root = %root, %error, "root routing object failed to build");
            return Ok(status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ));
        }
    };

    match handler.handle(request).await {
        Ok(response) => Ok(response.map(Full::new)),
        Err(error) => Ok(error_response(error)),
    }
}

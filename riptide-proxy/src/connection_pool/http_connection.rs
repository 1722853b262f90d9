//! The pooled HTTP/1.1 connection type and its TCP/TLS factory.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use riptide_core::errors::{TransportError, TransportErrorKind};
use riptide_core::http::{HttpRequest, HttpResponse};
use riptide_core::origin::{AppId, Origin, OriginId};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::pool::{ConnectFuture, ConnectionFactory, PoolableConnection};
use crate::tls::origin_client_config;

/// One HTTP/1.1 connection to an origin, exclusive to its holder.
pub struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    app: AppId,
    origin_id: OriginId,
    authority: String,
}

impl HttpConnection {
    fn error(&self, kind: TransportErrorKind) -> TransportError {
        TransportError::new(self.app.clone(), self.origin_id.clone(), kind)
    }

    /// Sends one request and aggregates the response body.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (mut parts, body) = request.into_parts();

        // Origin-form URI and an explicit Host header for the wire.
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = path
            .parse()
            .map_err(|e| self.error(TransportErrorKind::ConnectionLost(format!("bad uri: {e}"))))?;
        parts.headers.insert(
            http::header::HOST,
            http::HeaderValue::from_str(&self.authority)
                .map_err(|e| self.error(TransportErrorKind::ConnectionLost(e.to_string())))?,
        );
        let request = http::Request::from_parts(parts, Full::new(body));

        self.sender
            .ready()
            .await
            .map_err(|e| self.error(TransportErrorKind::ConnectionLost(e.to_string())))?;
        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(|e| self.error(TransportErrorKind::ConnectionLost(e.to_string())))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| self.error(TransportErrorKind::ConnectionLost(e.to_string())))?
            .to_bytes();
        Ok(http::Response::from_parts(parts, body))
    }
}

impl PoolableConnection for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Opens TCP (optionally TLS) connections and performs the HTTP/1.1
/// handshake; each connection's driver runs on its own task.
#[derive(Debug, Default)]
pub struct HttpConnectionFactory;

impl HttpConnectionFactory {
    async fn open(origin: Origin) -> Result<HttpConnection, TransportError> {
        let error = |kind| {
            TransportError::new(origin.application().clone(), origin.id().clone(), kind)
        };

        let stream = TcpStream::connect((origin.host(), origin.port()))
            .await
            .map_err(|e| error(TransportErrorKind::ConnectFailure(e.to_string())))?;

        let sender = match origin.tls() {
            Some(tls) => {
                let config = origin_client_config(tls)
                    .map_err(|e| error(TransportErrorKind::ConnectFailure(e.to_string())))?;
                let server_name = tls
                    .sni_host
                    .clone()
                    .unwrap_or_else(|| origin.host().to_string());
                let server_name = pki_types::ServerName::try_from(server_name)
                    .map_err(|e| error(TransportErrorKind::ConnectFailure(e.to_string())))?;
                let tls_stream = TlsConnector::from(Arc::new(config))
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| error(TransportErrorKind::ConnectFailure(e.to_string())))?;
                Self::handshake(&origin, TokioIo::new(tls_stream)).await?
            }
            None => Self::handshake(&origin, TokioIo::new(stream)).await?,
        };

        Ok(HttpConnection {
            sender,
            app: origin.application().clone(),
            origin_id: origin.id().clone(),
            authority: origin.host_and_port(),
        })
    }

    async fn handshake<IO>(
        origin: &Origin,
        io: IO,
    ) -> Result<http1::SendRequest<Full<Bytes>>, TransportError>
    where
        IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake(io).await.map_err(|e| {
            TransportError::new(
                origin.application().clone(),
                origin.id().clone(),
                TransportErrorKind::ConnectFailure(e.to_string()),
            )
        })?;

        let origin_label = origin.to_string();
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(origin = %origin_label, %error, "origin connection terminated");
            }
        });
        Ok(sender)
    }
}

impl ConnectionFactory<HttpConnection> for HttpConnectionFactory {
    fn connect(&self, origin: &Origin) -> ConnectFuture<HttpConnection> {
        let origin = origin.clone();
        Box::pin(Self::open(origin))
    }
}

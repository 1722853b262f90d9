//! HTTP type aliases used at the core's seams.
//!
//! The core passes fully aggregated messages around; wire framing and
//! streaming belong to the transport layer.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::errors::TransportError;

/// A proxied request with an aggregated body.
pub type HttpRequest = http::Request<Bytes>;

/// A proxied response with an aggregated body.
pub type HttpResponse = http::Response<Bytes>;

/// The future returned by transport sends.
pub type SendFuture = Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send>>;

/// Reads a named cookie's value out of a request's `Cookie` headers.
///
/// Parsing is deliberately minimal: `name=value` pairs separated by `;`.
pub fn request_cookie_value(request: &HttpRequest, name: &str) -> Option<String> {
    request
        .headers()
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
        .next()
}

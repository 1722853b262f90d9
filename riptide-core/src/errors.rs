//! Error taxonomy for the origin selection and resilience layer.
//!
//! Only transport-level failures flagged retryable participate in retry
//! evaluation. Everything else terminates the logical request and is mapped
//! to a gateway-style response at the boundary.

use std::sync::Arc;

use thiserror::Error;

use crate::origin::{AppId, OriginId};

/// A transport-level failure attributed to one attempt against one origin.
#[derive(Debug, Clone, Error)]
#[error("{kind}: app={app}, origin={origin}")]
pub struct TransportError {
    app: AppId,
    origin: OriginId,
    kind: TransportErrorKind,
}

impl TransportError {
    /// Creates an attributed transport error.
    pub fn new(app: AppId, origin: OriginId, kind: TransportErrorKind) -> Self {
        Self { app, origin, kind }
    }

    /// The application the failed attempt belonged to.
    pub fn app(&self) -> &AppId {
        &self.app
    }

    /// The origin the failed attempt was made against.
    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    /// The failure kind.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether this failure is eligible for the retry loop.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// The kinds of transport failure an attempt can end with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportErrorKind {
    /// The origin refused or failed the connection attempt.
    #[error("origin unreachable: {0}")]
    ConnectFailure(String),
    /// Connection establishment exceeded the configured connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// The per-origin connection pool was exhausted, including its pending queue.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// A queued connection acquisition exceeded the pending timeout.
    #[error("pending connection acquisition timed out")]
    PendingTimeout,
    /// The origin accepted the request but exceeded the response timeout.
    #[error("response timed out")]
    ResponseTimeout,
    /// The origin stalled while streaming response content.
    #[error("content timed out")]
    ContentTimeout,
    /// The connection was lost mid-exchange.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl TransportErrorKind {
    /// Failures that happen before the request reaches the origin can be
    /// retried against another origin; failures after that cannot, since the
    /// origin may already have acted on the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::ConnectFailure(_)
                | TransportErrorKind::ConnectTimeout
                | TransportErrorKind::PoolExhausted
                | TransportErrorKind::PendingTimeout
        )
    }
}

/// Failure to construct a domain value object from configuration.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// An origin definition was incomplete or malformed.
    #[error("invalid origin {origin}: {reason}")]
    InvalidOrigin {
        /// The offending origin.
        origin: OriginId,
        /// Why the definition was rejected.
        reason: String,
    },
    /// Two origins within one application share an id.
    #[error("duplicate origin id {origin} in application {app}")]
    DuplicateOriginId {
        /// The application being built.
        app: AppId,
        /// The duplicated id.
        origin: OriginId,
    },
    /// Two origins within one application share a (host, port) pair.
    #[error("duplicate origin address {host}:{port} in application {app}")]
    DuplicateOriginAddress {
        /// The application being built.
        app: AppId,
        /// The duplicated host.
        host: String,
        /// The duplicated port.
        port: u16,
    },
    /// A health-monitor threshold outside the valid range.
    #[error("health threshold must be at least 1, got {0}")]
    InvalidHealthThreshold(i64),
}

/// A terminal dispatch failure.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No eligible origin exists for the application. Terminal, not retryable,
    /// distinct from a per-attempt transport failure.
    #[error("no available hosts for application {0}")]
    NoAvailableHosts(AppId),
    /// The last attempt failed and the retry policy declined further attempts.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A fault inside a named extension, attributed and never retried.
    #[error("extension {name} failed: {cause}")]
    Plugin {
        /// The offending extension's name.
        name: String,
        /// The underlying fault.
        #[source]
        cause: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl DispatchError {
    /// Wraps an extension fault with the extension's name for attribution.
    pub fn plugin(
        name: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DispatchError::Plugin {
            name: name.into(),
            cause: Arc::new(cause),
        }
    }
}

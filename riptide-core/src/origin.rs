//! Origin and application identity models.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Deserialize;

use crate::errors::ServiceError;

/// The identifier of an application (a named group of origins).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct AppId(Arc<str>);

impl AppId {
    /// Creates an application id from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The identifier of a single origin within an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct OriginId(Arc<str>);

impl OriginId {
    /// Creates an origin id from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// TLS settings for connecting to an origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsSettings {
    /// Server name to present during the handshake. Defaults to the origin host.
    #[serde(default)]
    pub sni_host: Option<String>,
    /// Path to a PEM bundle of additional trusted CA certificates.
    #[serde(default)]
    pub trust_ca_file: Option<String>,
}

/// One backend server instance reachable at `host:port`.
///
/// Identity, equality and hashing are defined by `(application, id)` only;
/// host, port and TLS settings are attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "OriginDef")]
pub struct Origin {
    application: AppId,
    id: OriginId,
    host: String,
    port: u16,
    tls: Option<TlsSettings>,
}

impl Origin {
    /// Starts building an origin.
    pub fn builder(application: impl Into<AppId>, id: impl Into<OriginId>) -> OriginBuilder {
        OriginBuilder {
            application: application.into(),
            id: id.into(),
            host: None,
            port: None,
            tls: None,
        }
    }

    /// The owning application id.
    pub fn application(&self) -> &AppId {
        &self.application
    }

    /// This origin's id.
    pub fn id(&self) -> &OriginId {
        &self.id
    }

    /// The origin's host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the form used in logs and metrics.
    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TLS settings, when the origin is to be contacted over TLS.
    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Returns a copy of this origin owned by the given application.
    ///
    /// Used when a backend service adopts configured origins: the per-origin
    /// application id is always derived from the service id.
    pub fn with_application(&self, application: AppId) -> Origin {
        Origin {
            application,
            ..self.clone()
        }
    }
}

impl PartialEq for Origin {
    fn eq(&self, other: &Self) -> bool {
        self.application == other.application && self.id == other.id
    }
}

impl Eq for Origin {}

impl Hash for Origin {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.application.hash(state);
        self.id.hash(state);
    }
}

impl PartialOrd for Origin {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Origin {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.application, &self.id).cmp(&(&other.application, &other.id))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}:{})", self.application, self.id, self.host, self.port)
    }
}

/// Builder for [`Origin`].
#[derive(Debug)]
pub struct OriginBuilder {
    application: AppId,
    id: OriginId,
    host: Option<String>,
    port: Option<u16>,
    tls: Option<TlsSettings>,
}

impl OriginBuilder {
    /// Sets the host name or address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables TLS towards this origin.
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Builds the origin, validating that a host and port were given.
    pub fn build(self) -> Result<Origin, ServiceError> {
        let host = self
            .host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ServiceError::InvalidOrigin {
                origin: self.id.clone(),
                reason: "host must be set".to_string(),
            })?;
        let port = self.port.ok_or_else(|| ServiceError::InvalidOrigin {
            origin: self.id.clone(),
            reason: "port must be set".to_string(),
        })?;
        Ok(Origin {
            application: self.application,
            id: self.id,
            host,
            port,
            tls: self.tls,
        })
    }
}

/// Serde surface for origins arriving from a parsed configuration source.
#[derive(Debug, Deserialize)]
struct OriginDef {
    #[serde(default = "default_app")]
    application: AppId,
    id: OriginId,
    host: String,
    port: u16,
    #[serde(default)]
    tls: Option<TlsSettings>,
}

fn default_app() -> AppId {
    AppId::new("generic-app")
}

impl TryFrom<OriginDef> for Origin {
    type Error = ServiceError;

    fn try_from(def: OriginDef) -> Result<Self, Self::Error> {
        let mut builder = Origin::builder(def.application, def.id)
            .host(def.host)
            .port(def.port);
        if let Some(tls) = def.tls {
            builder = builder.tls(tls);
        }
        builder.build()
    }
}

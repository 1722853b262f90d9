//! TLS configuration at both edges: terminating client connections and
//! connecting to TLS-enabled origins.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use pki_types::{CertificateDer, PrivateKeyDer};
use riptide_core::origin::TlsSettings;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Loads a server-side TLS config from certificate and key paths.
pub fn load_server_config<P: AsRef<Path>>(
    cert_path: P,
    key_path: P,
) -> Result<Arc<ServerConfig>, Box<dyn std::error::Error + Send + Sync>> {
    let certs = read_certs(cert_path.as_ref())?;

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map(|res| res.map(PrivateKeyDer::Pkcs8))
        .collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err("no pkcs8 private key found".into());
    }
    let key = keys.remove(0);

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Builds the client config for connecting to one TLS-enabled origin.
///
/// The origin's `trust_ca_file` supplies the trust anchors; TLS origins
/// without one are a configuration error.
pub fn origin_client_config(settings: &TlsSettings) -> io::Result<ClientConfig> {
    let ca_file = settings.trust_ca_file.as_deref().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS origin has no trust_ca_file configured",
        )
    })?;

    let mut roots = RootCertStore::empty();
    for cert in read_certs(Path::new(ca_file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
    {
        roots
            .add(cert)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn read_certs(
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, Box<dyn std::error::Error + Send + Sync>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    Ok(rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?)
}

//! TLS connector for backend sessions
//!
//! Built once per profile at startup from the configured PEM trust bundle.
//! The bundle is the sole root set; the RDS hostname is both the SNI value
//! and the certificate verification identity.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{ProxyError, Result};

/// TLS connector bound to one backend host.
#[derive(Clone)]
pub struct BackendTlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for BackendTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTlsConnector")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl BackendTlsConnector {
    /// Build a connector from a PEM trust bundle.
    ///
    /// Fails if the bundle is unreadable or contains no parseable
    /// certificate. TLS 1.2 is the protocol floor (rustls's safe default
    /// versions are 1.2 and 1.3).
    pub fn new(ca_bundle: &Path, server_name: &str) -> Result<Self> {
        let certs = load_ca_certificates(ca_bundle)?;
        if certs.is_empty() {
            return Err(ProxyError::Tls(format!(
                "no certificates found in ca bundle {}",
                ca_bundle.display()
            )));
        }

        let mut roots = RootCertStore::empty();
        let (added, _ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ProxyError::Tls(format!(
                "invalid PEM in ca bundle {}",
                ca_bundle.display()
            )));
        }

        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid server name {:?}", server_name)))?;

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Upgrade an established TCP stream to TLS.
    pub async fn connect(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        self.inner
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake: {}", e)))
    }
}

fn load_ca_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("read ca bundle {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("parse ca bundle {}: {}", path.display(), e)))
}

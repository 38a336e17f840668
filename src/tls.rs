//! TLS plumbing: PEM loading for the listener, a connector for `+s`
//! upstream schemes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ProxyError;

/// Builds a TLS acceptor for the client-facing listener from PEM files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("bad certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the connector used for TLS upstream schemes, trusting the
/// standard web PKI roots.
pub fn upstream_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Config(format!(
            "failed to open certificate file {}: {e}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Config(format!("failed to open key file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => {
                // Certificates or other PEM blocks mixed into the key file.
            }
            Ok(None) => break,
            Err(e) => {
                return Err(ProxyError::Config(format!(
                    "failed to parse key file {}: {e}",
                    path.display()
                )));
            }
        }
    }

    Err(ProxyError::Config(format!(
        "no private key found in {}",
        path.display()
    )))
}

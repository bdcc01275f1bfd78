//! TLS setup for `tcps://` peer links.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    #[error("failed to create TLS config: {0}")]
    Config(#[from] rustls::Error),
}

pub type Result<T> = std::result::Result<T, TlsError>;

/// TLS material for both link directions.
///
/// The acceptor exists when a certificate and key were given; the connector
/// exists when a CA bundle was given.
#[derive(Clone, Default)]
pub struct TlsConfig {
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl TlsConfig {
    pub fn load(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        ca_path: Option<&Path>,
    ) -> Result<Self> {
        let acceptor = match (cert_path, key_path) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_private_key(key)?;
                Some(create_acceptor(certs, key)?)
            }
            _ => None,
        };

        let connector = match ca_path {
            Some(ca) => Some(create_connector(load_certs(ca)?)?),
            None => None,
        };

        info!(
            server = acceptor.is_some(),
            client = connector.is_some(),
            "Loaded TLS configuration"
        );
        Ok(Self {
            acceptor,
            connector,
        })
    }

    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    pub fn connector(&self) -> Option<&TlsConnector> {
        self.connector.as_ref()
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let shown = path.display().to_string();
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: shown.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: shown.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(shown));
    }
    debug!(count = certs.len(), path = %path.display(), "Loaded certificates");
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let shown = path.display().to_string();
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: shown.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: shown.clone(),
            source,
        })?
        .ok_or(TlsError::NoPrivateKey(shown))
}

fn create_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn create_connector(ca_certs: Vec<CertificateDer<'static>>) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert)?;
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

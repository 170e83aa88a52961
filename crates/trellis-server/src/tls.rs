//! TLS negotiation with ALPN.
//!
//! [`TlsNegotiator`] terminates TLS on an accepted connection and picks the
//! application protocol from the client's ALPN extension. The ClientHello is
//! read first, so the protocol is chosen by the connection's
//! [`ProtocolSelector`] (server order wins) before the handshake continues
//! with a config that advertises exactly that protocol.
//!
//! The crypto provider is an explicit constructor argument; nothing is
//! registered process-wide.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::LazyConfigAcceptor;

use crate::connection::Connection;
use crate::error::NegotiationError;
use crate::negotiation::{Negotiated, Negotiator, ProtocolSelector};

/// TLS setup errors.
#[derive(Error, Debug)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("cannot read '{}': {source}", .path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate file holds no certificate.
    #[error("no certificate found in '{}'", .path.display())]
    NoCertificates {
        /// Certificate file.
        path: PathBuf,
    },

    /// The key file holds no private key.
    #[error("no private key found in '{}'", .path.display())]
    NoPrivateKey {
        /// Key file.
        path: PathBuf,
    },

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// The ring-backed crypto provider.
#[must_use]
pub fn ring_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let path = path.as_ref();
    let io_error = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(io_error)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path = path.as_ref();
    let io_error = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(io_error)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(io_error)?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Terminates TLS and negotiates the protocol through ALPN.
pub struct TlsNegotiator {
    base: Arc<ServerConfig>,
    by_protocol: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl TlsNegotiator {
    /// Builds a negotiator serving `certs` with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Rustls`] if the provider or key is unusable.
    pub fn new(
        provider: Arc<CryptoProvider>,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::from_config(config))
    }

    /// Builds a negotiator from PEM files.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] if a file cannot be read or holds no usable
    /// material.
    pub fn from_pem_files(
        provider: Arc<CryptoProvider>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Self::new(provider, certs, key)
    }

    /// Wraps a prepared config. Its ALPN list is replaced per connection.
    #[must_use]
    pub fn from_config(mut config: ServerConfig) -> Self {
        config.alpn_protocols.clear();
        Self {
            base: Arc::new(config),
            by_protocol: Mutex::new(HashMap::new()),
        }
    }

    /// Config for a handshake that settled on `protocol`.
    ///
    /// When the client did not offer the protocol (default fallback) ALPN is
    /// left out of the handshake, since rustls aborts when the server lists
    /// protocols the client never offered.
    fn config_for(&self, protocol: &str, offered_by_client: bool) -> Arc<ServerConfig> {
        if !offered_by_client {
            return self.base.clone();
        }

        self.by_protocol
            .lock()
            .entry(protocol.to_string())
            .or_insert_with(|| {
                let mut config = (*self.base).clone();
                config.alpn_protocols = vec![protocol.as_bytes().to_vec()];
                Arc::new(config)
            })
            .clone()
    }
}

#[async_trait]
impl Negotiator for TlsNegotiator {
    fn name(&self) -> &str {
        "alpn"
    }

    async fn negotiate(
        &self,
        connection: Connection,
        selector: &ProtocolSelector,
    ) -> Result<Negotiated, NegotiationError> {
        let (io, parts) = connection.into_parts();

        let start = LazyConfigAcceptor::new(Acceptor::default(), io)
            .await
            .map_err(NegotiationError::handshake)?;

        let offered: Vec<Vec<u8>> = start
            .client_hello()
            .alpn()
            .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
            .unwrap_or_default();

        let protocol = selector.select(&offered)?.to_string();
        let offered_by_client = offered.iter().any(|p| p.as_slice() == protocol.as_bytes());

        tracing::debug!(
            remote_addr = %parts.info().remote_addr,
            protocol = %protocol,
            alpn = offered_by_client,
            "TLS protocol selected"
        );

        let stream = start
            .into_stream(self.config_for(&protocol, offered_by_client))
            .await
            .map_err(NegotiationError::handshake)?;

        Ok(Negotiated {
            connection: parts.reassemble(stream),
            protocol,
        })
    }
}

impl fmt::Debug for TlsNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsNegotiator")
            .field("cached_configs", &self.by_protocol.lock().len())
            .finish_non_exhaustive()
    }
}

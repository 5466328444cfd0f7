//! Loading the federation's mutual-TLS material. PEM and DER (by `.der` extension) both work.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use quinn::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
    RootCertStore,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{fs, io};
use tracing::info;

/// Paths to the certificates and keys shared by the federation's private CA.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsPaths {
    /// Certificate presented by our QUIC server.
    pub server_cert: PathBuf,
    /// Key of the server certificate.
    pub server_key: PathBuf,
    /// Certificate presented when we connect to peers.
    pub client_cert: PathBuf,
    /// Key of the client certificate.
    pub client_key: PathBuf,
    /// The federation CA.
    pub ca_cert: PathBuf,
}

/// TLS material that could not be loaded.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// A PEM file held no private key.
    #[error("no private key in {0}")]
    MissingKey(PathBuf),

    /// The CA file held no usable certificate.
    #[error("no usable CA certificate in {0}")]
    EmptyCa(PathBuf),

    /// rustls refused the configuration.
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),

    /// The client verifier could not be built.
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Installs the ring crypto provider as the process default, if none is installed yet.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

async fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).await.map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a private key.
pub async fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key = read(path).await?;
    if path.extension().is_some_and(|x| x == "der") {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)));
    }
    rustls_pemfile::private_key(&mut &*key)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingKey(path.to_path_buf()))
}

/// Reads a certificate chain.
pub async fn read_cert(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let cert_chain = read(path).await?;
    if path.extension().is_some_and(|x| x == "der") {
        Ok(vec![CertificateDer::from(cert_chain)])
    } else {
        rustls_pemfile::certs(&mut &*cert_chain)
            .collect::<Result<_, _>>()
            .map_err(|source| TlsError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

async fn root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(read_cert(path).await?);
    info!(added, ignored, "loaded federation CA certificates");
    if added == 0 {
        return Err(TlsError::EmptyCa(path.to_path_buf()));
    }
    Ok(root_store)
}

/// Server config that requires a client certificate issued by the federation CA.
pub async fn load_server_config(paths: &TlsPaths) -> Result<rustls::ServerConfig, TlsError> {
    let certs = read_cert(&paths.server_cert).await?;
    let key = read_key(&paths.server_key).await?;
    let verifier =
        WebPkiClientVerifier::builder(Arc::new(root_store(&paths.ca_cert).await?)).build()?;
    Ok(rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?)
}

/// Client config that trusts only the federation CA and presents our client certificate.
pub async fn load_client_config(paths: &TlsPaths) -> Result<rustls::ClientConfig, TlsError> {
    let certs = read_cert(&paths.client_cert).await?;
    let key = read_key(&paths.client_key).await?;
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(root_store(&paths.ca_cert).await?)
        .with_client_auth_cert(certs, key)?)
}

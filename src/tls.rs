//! TLS material and rustls configuration
//!
//! Client-facing TLS uses either the PEM identity named in the
//! configuration or a self-signed certificate generated at startup. The
//! outbound side is a capture tool, not a browser: it accepts any server
//! certificate and presents the configured identity as a client
//! certificate when one is available.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Host names the generated certificate is issued for
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
}

/// Certificate chain and private key
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a PEM certificate chain and private key
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let (certs, key) = load_certs_and_key(cert_path, key_path)?;
        Ok(Self { certs, key })
    }

    /// Generate a throwaway self-signed identity for `localhost`
    pub fn self_signed() -> Result<Self, TlsError> {
        let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names)?;

        Ok(Self {
            certs: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.key_pair.serialize_der(),
            )),
        })
    }

    /// The configured identity if both paths are given, otherwise a
    /// generated one
    pub fn from_paths(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<Self, TlsError> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => {
                info!("[TLS] Using identity from {}", cert.display());
                Self::load(cert, key)
            }
            _ => {
                info!("[TLS] No identity configured, generating self-signed certificate");
                Self::self_signed()
            }
        }
    }

    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Load TLS certificates and private key from PEM files
pub fn load_certs_and_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_file = File::open(cert_path).map_err(io_error(cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(cert_path))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key_file = File::open(key_path).map_err(io_error(key_path))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(io_error(key_path))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    debug!(
        "[TLS] Loaded {} certificate(s) from {}",
        certs.len(),
        cert_path.display()
    );

    Ok((certs, key))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TlsError {
    let path = path.to_path_buf();
    move |source| TlsError::Io { path, source }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create the acceptor for client-facing TLS
pub fn create_tls_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor, TlsError> {
    let mut tls_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())?;

    // The proxy only understands HTTP/1.1 framing
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Create the connector for server-facing TLS
pub fn create_tls_connector(client_identity: Option<&TlsIdentity>) -> Result<TlsConnector, TlsError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));

    let mut tls_config = match client_identity {
        Some(identity) => {
            builder.with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())?
        }
        None => builder.with_no_client_auth(),
    };

    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Server name for an outbound handshake; IP addresses are accepted
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

/// Server certificate verifier that trusts everything
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

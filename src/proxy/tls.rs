//! TLS termination and origination.
//!
//! - Client handshakes read the ClientHello first, then present a leaf from
//!   the [`CertificateAuthority`] for the SNI name, falling back to the
//!   CONNECT host. Leaves are issued on the blocking pool, never on the
//!   async worker driving the handshake.
//! - TLS connectors for upstream connections (proxy as client), verifying
//!   against the system roots or, when configured, not at all
//!
//! # ALPN
//!
//! HTTP/1.1 is forced via ALPN on both legs. The forwarding path speaks
//! HTTP/1.1 framing only; letting a client negotiate `h2` after the
//! handshake would break it.

use super::error::ProxyError;
use crate::ca::CertificateAuthority;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

const HTTP11: &[u8] = b"http/1.1";

/// Resolver presenting one leaf issued for this handshake.
#[derive(Debug)]
struct IssuedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for IssuedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Server config presenting `key`, with ALPN pinned to HTTP/1.1.
fn server_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuedCert(key)));
    config.alpn_protocols = vec![HTTP11.to_vec()];
    Arc::new(config)
}

/// Accept a client TLS connection on `io`.
///
/// The leaf is issued for the SNI name in the ClientHello, or for
/// `fallback_host` when the client sends none (IP literals, old clients).
/// A failure to issue aborts the handshake; the connection is never
/// downgraded to plaintext.
pub async fn accept_client<IO>(
    ca: Arc<CertificateAuthority>,
    io: IO,
    fallback_host: &str,
) -> Result<TlsStream<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), io)
        .await
        .map_err(|e| ProxyError::Tls(format!("Failed to read ClientHello: {}", e)))?;

    let host = start
        .client_hello()
        .server_name()
        .unwrap_or(fallback_host)
        .to_string();
    trace!("Resolving certificate for: {}", host);

    let entry = tokio::task::spawn_blocking(move || ca.certificate_for_host(&host))
        .await
        .map_err(|e| ProxyError::Channel(e.to_string()))??;

    start
        .into_stream(server_config(entry.certified_key()))
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))
}

/// Create a TLS connector verifying upstream servers against the system
/// root certificates.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP11.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Create a TLS connector that accepts any upstream certificate.
pub fn create_insecure_tls_connector() -> TlsConnector {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let verifier = Arc::new(NoVerification {
        provider: Arc::new(provider),
    });

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP11.to_vec()];

    TlsConnector::from(Arc::new(config))
}

/// Upstream connectors, built once per controller.
///
/// The verifying connector loads the system roots on first use.
#[derive(Default)]
pub struct UpstreamConnectors {
    verified: OnceLock<Result<TlsConnector, String>>,
    insecure: OnceLock<TlsConnector>,
}

impl UpstreamConnectors {
    /// Create an empty set of connectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for the given verification mode.
    pub fn get(&self, accept_invalid_certs: bool) -> Result<TlsConnector, ProxyError> {
        if accept_invalid_certs {
            return Ok(self.insecure.get_or_init(create_insecure_tls_connector).clone());
        }

        self.verified
            .get_or_init(|| create_tls_connector().map_err(|e| e.to_string()))
            .clone()
            .map_err(ProxyError::Tls)
    }
}

/// Convert a host string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

/// Verifier that accepts every certificate but still checks handshake
/// signatures.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        warn!("Skipping certificate verification for {:?}", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_connector_creation() {
        // Minimal systems may have no roots; that is a reported error, not a panic
        let _ = create_tls_connector();
    }

    #[test]
    fn test_connectors_are_cached() {
        let connectors = UpstreamConnectors::new();
        assert!(connectors.get(true).is_ok());
        assert!(connectors.insecure.get().is_some());
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
        assert!(domain_to_server_name("").is_err());
    }

    fn client_for(ca: &CertificateAuthority) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.root_certificate().unwrap().cert_der().clone()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Handshake over a pipe and echo four bytes back.
    async fn echo_handshake(ca: Arc<CertificateAuthority>, server_name: &str, fallback: &str) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let connector = client_for(&ca);
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let fallback = fallback.to_string();
        let server = tokio::spawn(async move {
            let mut tls = accept_client(ca, server_io, &fallback).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut tls = connector
            .connect(domain_to_server_name(server_name).unwrap(), client_io)
            .await
            .unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_presents_leaf_for_sni() {
        let ca = Arc::new(CertificateAuthority::new());
        echo_handshake(ca.clone(), "api.sni.test", "fallback.test").await;

        assert_eq!(ca.cached_hosts(), vec!["api.sni.test".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_without_sni_uses_fallback() {
        // Clients send no SNI for IP literals
        let ca = Arc::new(CertificateAuthority::new());
        echo_handshake(ca.clone(), "10.1.2.3", "10.1.2.3").await;

        assert_eq!(ca.cached_hosts(), vec!["10.1.2.3".to_string()]);
    }

    #[tokio::test]
    async fn test_non_tls_bytes_fail_handshake() {
        use tokio::io::AsyncWriteExt;

        let ca = Arc::new(CertificateAuthority::new());
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        client_io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = accept_client(ca.clone(), server_io, "a.test").await.unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
        assert!(ca.is_empty());
    }
}

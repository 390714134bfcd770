//! QUIC transport configuration

use crate::cert::generate_self_signed_cert;
use rdproxy_transport::{TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Certificate chain and key presented by the session server
pub struct ServerIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }

    /// Load a PEM certificate chain and private key
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        Ok(Self::new(load_certs(cert_path)?, load_private_key(key_path)?))
    }

    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Certificate and key (servers only)
    identity: Option<Arc<ServerIdentity>>,

    /// Trusted roots (clients only); empty means the webpki roots
    root_certs: Vec<CertificateDer<'static>>,

    /// Verify the server certificate (clients only)
    verify_server_cert: bool,

    /// ALPN protocols offered or accepted
    pub alpn_protocols: Vec<String>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Virtual connections a session may carry at once
    pub max_concurrent_streams: u32,
}

impl QuicConfig {
    /// Client configuration: 3 s keep-alive, 10 s idle timeout
    ///
    /// Uses the webpki root CAs unless roots are added with
    /// [`QuicConfig::with_root_certificate`].
    pub fn client_default() -> Self {
        Self {
            identity: None,
            root_certs: Vec::new(),
            verify_server_cert: true,
            alpn_protocols: vec![rdproxy_proto::ALPN.to_string()],
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1000,
        }
    }

    /// Client configuration that skips server certificate verification
    ///
    /// **INSECURE**: only for local development against a self-signed
    /// gateway certificate.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Server configuration presenting `identity`
    pub fn server(identity: ServerIdentity) -> Self {
        Self {
            identity: Some(Arc::new(identity)),
            ..Self::client_default()
        }
    }

    /// Server configuration from PEM certificate and key files
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        Ok(Self::server(ServerIdentity::from_pem_files(
            cert_path, key_path,
        )?))
    }

    /// Server configuration with an ephemeral in-memory self-signed certificate
    ///
    /// The certificate covers `localhost`, the loopback addresses and every
    /// extra name given. Clients must either trust [`QuicConfig::certificates`]
    /// explicitly or skip verification.
    pub fn server_self_signed(extra_names: &[String]) -> TransportResult<Self> {
        let cert = generate_self_signed_cert(extra_names)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;
        Ok(Self::server(ServerIdentity::new(
            vec![cert.cert_der],
            cert.key_der,
        )))
    }

    /// Certificates presented by a server configuration
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        self.identity
            .as_ref()
            .map(|identity| identity.certs())
            .unwrap_or_default()
    }

    /// Trust `cert` as a root when verifying the server
    pub fn with_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certs.push(cert);
        self
    }

    /// Trust every certificate in a PEM file
    pub fn with_root_certificates_from_pem(mut self, path: &Path) -> TransportResult<Self> {
        self.root_certs.extend(load_certs(path)?);
        Ok(self)
    }

    /// Accept any server certificate
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "keep-alive interval must not be zero".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "idle timeout must cover at least two keep-alive intervals".to_string(),
            ));
        }

        if self.alpn_protocols.is_empty() {
            return Err(TransportError::ConfigurationError(
                "At least one ALPN protocol is required".to_string(),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_streams));
        // Streams are only ever opened bidirectionally.
        transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
        Ok(transport)
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        crate::ensure_crypto_provider();
        self.validate()?;

        let mut client_crypto = if self.verify_server_cert {
            let mut roots = rustls::RootCertStore::empty();
            if self.root_certs.is_empty() {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            } else {
                for cert in &self.root_certs {
                    roots.add(cert.clone()).map_err(|e| {
                        TransportError::ConfigurationError(format!("Rejected root certificate: {}", e))
                    })?;
                }
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self.alpn();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        crate::ensure_crypto_provider();
        self.validate()?;

        let identity = self.identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server certificate required".to_string())
        })?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.certs.clone(), identity.key.clone_key())
            .map_err(|e| TransportError::TlsError(format!("Certificate and key do not match: {}", e)))?;

        server_crypto.alpn_protocols = self.alpn();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Unreadable private key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError(format!("No private key in {}", path.display())))
}

// Certificate verifier that accepts anything (INSECURE - only for development!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

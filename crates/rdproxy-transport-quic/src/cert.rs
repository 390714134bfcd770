//! Self-signed certificate generation for development and testing

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// A generated certificate and its key, DER encoded
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate an ephemeral self-signed certificate
///
/// Valid for `localhost`, `127.0.0.1`, `::1` and every name in `extra_names`
/// (DNS names or IP literals). **DO NOT use in production.**
pub fn generate_self_signed_cert(
    extra_names: &[String],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    for name in extra_names {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    let mut params = CertificateParams::new(names)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "rdproxy gateway");
    dn.push(DnType::OrganizationName, "rdproxy development");
    params.distinguished_name = dn;

    let key_pair =
        KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    })
}

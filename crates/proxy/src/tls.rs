//! TLS material handling
//!
//! Turns the opaque certificate/key bytes handed over by the configuration
//! loader into a server-side acceptor, and the upstream TLS options into a
//! client-side connector. Both are immutable once built and shared by every
//! session.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, DigitallySignedStruct, InconsistentKeys, RootCertStore, ServerConfig,
    SignatureScheme,
};
use serde::{Deserialize, Serialize};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{ProxyError, Result};

/// TLS protocol versions the listener may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn protocol_version(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }

    /// Both versions, newest first
    pub fn all() -> Vec<TlsVersion> {
        vec![TlsVersion::Tls13, TlsVersion::Tls12]
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(ProxyError::Config("No certificates found in PEM data".into()));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| ProxyError::Config(format!("Failed to parse private key PEM: {e}")))
}

/// Build the server-side acceptor
///
/// Fails with [`ProxyError::Config`] when the certificate chain or key cannot
/// be parsed, when the key is not the one the leaf certificate was issued
/// for, or when no protocol version is allowed.
pub fn build_acceptor(
    cert_chain_pem: &[u8],
    private_key_pem: &[u8],
    versions: &[TlsVersion],
) -> Result<TlsAcceptor> {
    if versions.is_empty() {
        return Err(ProxyError::Config("At least one TLS version is required".into()));
    }

    let certs = parse_certificates(cert_chain_pem)?;
    let key = parse_private_key(private_key_pem)?;
    let provider = provider();

    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| ProxyError::Config(format!("Unsupported private key: {e}")))?;
    match CertifiedKey::new(certs.clone(), signing_key).keys_match() {
        // The key type cannot expose its public half, nothing to compare
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(rustls::Error::InconsistentKeys(e)) => {
            return Err(ProxyError::Config(format!(
                "Certificate and private key do not match: {e:?}"
            )));
        }
        Err(e) => return Err(ProxyError::Config(format!("Invalid certificate: {e}"))),
    }

    let protocol_versions: Vec<_> = versions.iter().map(|v| v.protocol_version()).collect();
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocol_versions)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build the client-side connector used towards the upstream
///
/// With `verify` set, the upstream certificate must chain to the Mozilla
/// roots or to one of the certificates in `extra_ca_pem`.
pub fn build_connector(extra_ca_pem: Option<&[u8]>, verify: bool) -> Result<TlsConnector> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let client_config = if verify {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(pem) = extra_ca_pem {
            for cert in parse_certificates(pem)? {
                root_store
                    .add(cert)
                    .map_err(|e| ProxyError::Config(format!("Invalid upstream CA: {e}")))?;
            }
        }
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(
                &provider,
            )))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Parse the name presented to the upstream in SNI and checked against its
/// certificate
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    let name = name.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(name.to_string())
        .map_err(|_| ProxyError::Config(format!("Invalid upstream server name: {name}")))
}

/// Accepts any upstream certificate while still checking handshake
/// signatures, for backends with self-signed certificates
#[derive(Debug)]
struct NoCertificateVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoCertificateVerification {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(name: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (cert.pem(), signing_key.serialize_pem())
    }

    #[test]
    fn test_acceptor_from_valid_pair() {
        let (cert, key) = self_signed("localhost");
        assert!(build_acceptor(cert.as_bytes(), key.as_bytes(), &TlsVersion::all()).is_ok());
    }

    #[test]
    fn test_acceptor_rejects_garbage() {
        let (cert, key) = self_signed("localhost");

        let err = build_acceptor(b"not a certificate", key.as_bytes(), &TlsVersion::all());
        assert!(matches!(err, Err(ProxyError::Config(_))));

        let err = build_acceptor(cert.as_bytes(), b"not a key", &TlsVersion::all());
        assert!(matches!(err, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_acceptor_rejects_mismatched_key() {
        let (cert, _) = self_signed("localhost");
        let (_, other_key) = self_signed("localhost");

        let result = build_acceptor(cert.as_bytes(), other_key.as_bytes(), &TlsVersion::all());
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_acceptor_requires_a_version() {
        let (cert, key) = self_signed("localhost");
        assert!(build_acceptor(cert.as_bytes(), key.as_bytes(), &[]).is_err());
    }

    #[test]
    fn test_connector_with_extra_ca() {
        let (cert, _) = self_signed("backend.internal");
        assert!(build_connector(Some(cert.as_bytes()), true).is_ok());
        assert!(build_connector(Some(b"garbage"), true).is_err());
        assert!(build_connector(None, false).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("not a host!").is_err());
    }

    #[test]
    fn test_tls_version_serde() {
        #[derive(Deserialize)]
        struct Versions {
            tls_versions: Vec<TlsVersion>,
        }

        let parsed: Versions = serde_json::from_str(r#"{"tls_versions":["1.2","1.3"]}"#).unwrap();
        assert_eq!(parsed.tls_versions, vec![TlsVersion::Tls12, TlsVersion::Tls13]);
    }
}

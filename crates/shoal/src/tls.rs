//! rustls plumbing for the cluster control plane.
//!
//! The HTTPS listener presents the cluster certificate through a resolver
//! that can be swapped at runtime, so `PUT /cluster/certificates/cluster`
//! takes effect without a restart. Client certificates are accepted at the
//! handshake layer and authorized per request against the trust store;
//! joiners present a certificate that is not yet trusted and are admitted
//! by their token instead.

use std::sync::{Arc, RwLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tracing::info;

use crate::error::{ClusterError, Result};
use crate::identity::{format_sha256_hex, KeyPair};

fn provider() -> Arc<CryptoProvider> {
    let provider = rustls::crypto::ring::default_provider();
    let _ = provider.clone().install_default();
    Arc::new(provider)
}

/// Parses every certificate in a PEM bundle.
pub fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| ClusterError::transport(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ClusterError::transport("no certificate found in PEM data"));
    }
    Ok(certs)
}

/// Parses the first private key in a PEM bundle.
pub fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClusterError::transport(format!("failed to parse key PEM: {e}")))?
        .ok_or_else(|| ClusterError::transport("no private key found in PEM data"))
}

fn certified_key(keypair: &KeyPair) -> Result<CertifiedKey> {
    let certs = load_certs_from_pem(&keypair.cert_pem)?;
    let key_der = load_private_key_from_pem(&keypair.key_pem)?;
    let key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| ClusterError::transport(format!("unsupported private key: {e}")))?;
    Ok(CertifiedKey::new(certs, key))
}

/// Server certificate resolver whose keypair can be replaced at runtime.
///
/// Consulted on every TLS handshake; `reload` swaps the certificate the
/// next handshake will see.
#[derive(Debug)]
pub struct HotSwapCertResolver {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl HotSwapCertResolver {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    pub fn reload(&self, keypair: &KeyPair) -> Result<()> {
        let certified = Arc::new(certified_key(keypair)?);
        let mut current = self
            .current
            .write()
            .map_err(|_| ClusterError::internal("certificate resolver lock poisoned"))?;
        *current = Some(certified);
        info!("reloaded listener certificate");
        Ok(())
    }
}

impl Default for HotSwapCertResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl rustls::server::ResolvesServerCert for HotSwapCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().ok()?.clone()
    }
}

/// Accepts any well-formed client certificate at the handshake layer.
///
/// Authorization happens per request: handlers compare the presented
/// fingerprint against the trust store, and the join endpoint admits
/// untrusted certificates carrying a valid token.
#[derive(Debug)]
struct AnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds the server config for the HTTPS cluster socket.
pub fn server_config(resolver: Arc<HotSwapCertResolver>) -> Result<ServerConfig> {
    let provider = provider();
    let verifier = Arc::new(AnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    });

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::transport(format!("failed to build server TLS config: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);

    Ok(config)
}

/// Verifies the server against a single pinned SHA-256 fingerprint.
#[derive(Debug)]
struct PinnedServerCert {
    fingerprint: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented = format_sha256_hex(end_entity.as_ref());
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate fingerprint {presented} does not match pinned {}",
                self.fingerprint
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds a client config that presents `identity` and pins the remote
/// server certificate to `fingerprint`.
pub fn pinned_client_config(identity: &KeyPair, fingerprint: &str) -> Result<ClientConfig> {
    let provider = provider();
    let verifier = Arc::new(PinnedServerCert {
        fingerprint: fingerprint.to_lowercase(),
        algorithms: provider.signature_verification_algorithms,
    });

    let certs = load_certs_from_pem(&identity.cert_pem)?;
    let key = load_private_key_from_pem(&identity.key_pem)?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::transport(format!("failed to build client TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClusterError::transport(format!("failed to set client identity: {e}")))?;

    Ok(config)
}

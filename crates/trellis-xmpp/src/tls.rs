//! TLS setup for STARTTLS on client, server and outbound server streams.
//!
//! Certificates are picked per domain from the [`CertStore`] through SNI.
//! Peer certificates are accepted at the handshake as long as the signature
//! over the handshake verifies; whether a peer is trusted for the domain it
//! claims is decided later by SASL EXTERNAL.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::certs::CertStore;
use crate::XmppError;

/// The crypto provider used for every TLS config we build.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a certificate chain and private key into a signing key.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, XmppError> {
    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config(format!(
            "No certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| XmppError::config("No private key found"))?;
    let signing_key = provider.key_provider.load_private_key(key)?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Picks the certificate for the SNI name of the incoming handshake.
#[derive(Debug, Default)]
pub struct DomainCertResolver {
    keys: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl DomainCertResolver {
    /// Load a key for every domain the store has files for.
    ///
    /// The first domain that loads doubles as the fallback for handshakes
    /// without SNI.
    pub fn load<'a>(
        domains: impl IntoIterator<Item = &'a str>,
        store: &dyn CertStore,
        provider: &CryptoProvider,
    ) -> Result<Self, XmppError> {
        let mut resolver = Self::default();
        for domain in domains {
            let Some((cert, key)) = store.files_for_domain(domain) else {
                warn!(domain = %domain, "No certificate for domain, STARTTLS unavailable for it");
                continue;
            };
            let certified = load_certified_key(&cert, &key, provider)?;
            debug!(domain = %domain, cert = %cert.display(), "Loaded domain certificate");
            if resolver.fallback.is_none() {
                resolver.fallback = Some(Arc::clone(&certified));
            }
            resolver.keys.insert(domain.to_string(), certified);
        }
        Ok(resolver)
    }

    /// Whether any certificate was loaded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key for a domain, if one was loaded.
    pub fn key_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.keys.get(domain).cloned()
    }
}

impl ResolvesServerCert for DomainCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.keys.get(name))
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Requests a client certificate but leaves the trust decision to SASL
/// EXTERNAL.
#[derive(Debug)]
pub struct DeferredClientCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredClientCertVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for DeferredClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Outbound counterpart of [`DeferredClientCertVerifier`]: the remote
/// server's certificate is checked against the [`CertStore`] once the
/// handshake completes.
#[derive(Debug)]
pub struct DeferredServerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredServerCertVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for DeferredServerCertVerifier {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Presents our domain certificate on outbound server streams.
#[derive(Debug)]
struct DomainClientCert(Arc<CertifiedKey>);

impl ResolvesClientCert for DomainClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Everything a connection needs to upgrade to TLS in either direction.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    resolver: Arc<DomainCertResolver>,
    provider: Arc<CryptoProvider>,
}

impl TlsContext {
    /// Build the acceptor for `domains`. Returns `None` when the store has
    /// no certificate for any of them.
    pub fn load<'a>(
        domains: impl IntoIterator<Item = &'a str>,
        store: &dyn CertStore,
    ) -> Result<Option<Self>, XmppError> {
        let provider = provider();
        let resolver = Arc::new(DomainCertResolver::load(domains, store, &provider)?);
        if resolver.is_empty() {
            return Ok(None);
        }

        let server_config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(DeferredClientCertVerifier::new(Arc::clone(
                &provider,
            ))))
            .with_cert_resolver(resolver.clone());

        info!(domains = resolver.keys.len(), "TLS configured");

        Ok(Some(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            resolver,
            provider,
        }))
    }

    /// Acceptor for inbound STARTTLS.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Connector for an outbound server stream, presenting the certificate
    /// of `local_domain` for SASL EXTERNAL.
    pub fn connector(&self, local_domain: &str) -> Result<TlsConnector, XmppError> {
        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredServerCertVerifier::new(
                Arc::clone(&self.provider),
            )));

        let config = match self.resolver.key_for(local_domain) {
            Some(key) => builder.with_client_cert_resolver(Arc::new(DomainClientCert(key))),
            None => builder.with_no_client_auth(),
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

//! Per-connection TLS configuration
//!
//! Each accepted connection gets its own `ServerConfig`: the certificate is
//! picked after routing the ClientHello and the cipher suites follow the
//! entrypoint's suite set.

use crate::settings::TlsCipherSuiteSet;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{CipherSuite, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use std::sync::Arc;

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// TLS 1.2 suites kept by the `Modern` set
const MODERN_TLS12: &[CipherSuite] = &[
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Whether the client is performing a TLS-ALPN-01 validation
pub fn is_acme_tls_alpn(client_hello: &ClientHello<'_>) -> bool {
    client_hello
        .alpn()
        .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
        .unwrap_or(false)
}

/// Crypto provider restricted to a cipher-suite set
pub fn provider(set: TlsCipherSuiteSet) -> Arc<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    match set {
        TlsCipherSuiteSet::Default => {}
        TlsCipherSuiteSet::Modern => provider.cipher_suites.retain(|suite| match suite {
            SupportedCipherSuite::Tls13(_) => true,
            SupportedCipherSuite::Tls12(_) => MODERN_TLS12.contains(&suite.suite()),
        }),
        TlsCipherSuiteSet::Strict => provider
            .cipher_suites
            .retain(|suite| matches!(suite, SupportedCipherSuite::Tls13(_))),
    }
    Arc::new(provider)
}

static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

fn protocol_versions(set: TlsCipherSuiteSet) -> &'static [&'static SupportedProtocolVersion] {
    match set {
        TlsCipherSuiteSet::Strict => &TLS13_ONLY,
        _ => rustls::ALL_VERSIONS,
    }
}

/// Serve one certificate regardless of SNI
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Config for a routed connection, offering HTTP/2 and HTTP/1.1
pub fn server_config(set: TlsCipherSuiteSet, cert: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(provider(set))
        .with_protocol_versions(protocol_versions(set))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(cert)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Config that answers a TLS-ALPN-01 validation with its challenge certificate
pub fn acme_challenge_config(cert: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(provider(TlsCipherSuiteSet::Default))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(cert)));
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
    Ok(Arc::new(config))
}

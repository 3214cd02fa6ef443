//! Certificate files on disk
//!
//! Each certificate is stored as a PEM bundle: the certificate chain followed by
//! a PKCS#8 private key. File names come from the domain they serve.

use crate::error::CertError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WILDCARD_FILE_NAME: &str = "_wildcard_";
const CERT_EXTENSION: &str = "pem";
const WRITE_ATTEMPTS: u32 = 6;
const WRITE_BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Lowercase, filesystem-safe name for a domain's certificate file
pub fn domain_to_file_name(domain: &str) -> String {
    let domain = domain.trim();
    if domain == "*" {
        return WILDCARD_FILE_NAME.to_string();
    }
    domain
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

/// Default certificate path for a domain inside a certs directory
pub fn default_cert_path(certs_dir: &Path, domain: &str) -> PathBuf {
    certs_dir.join(format!("{}.{}", domain_to_file_name(domain), CERT_EXTENSION))
}

/// A parsed certificate ready for the TLS stack
#[derive(Clone)]
pub struct LoadedCert {
    pub key: Arc<CertifiedKey>,
    /// Expiration of the leaf certificate, seconds since the Unix epoch
    pub not_after: i64,
}

impl std::fmt::Debug for LoadedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedCert")
            .field("chain_len", &self.key.cert.len())
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Parse a PEM bundle into a signing key and certificate chain
pub fn parse_bundle(pem: &[u8]) -> Result<LoadedCert, CertError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<_, _>>()
        .map_err(CertError::FileIo)?;
    let leaf = certs
        .first()
        .ok_or_else(|| CertError::Generation("no certificate in bundle".to_string()))?;
    let not_after = not_after(leaf)?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(CertError::FileIo)?
        .ok_or_else(|| CertError::Generation("no private key in bundle".to_string()))?;

    Ok(LoadedCert {
        key: certified_key(certs, &key)?,
        not_after,
    })
}

pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, CertError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| CertError::Generation(format!("Failed to create signing key: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Expiration of a DER certificate in Unix seconds
pub fn not_after(cert: &CertificateDer<'_>) -> Result<i64, CertError> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| CertError::Generation(format!("Failed to parse X.509 certificate: {}", e)))?;
    Ok(parsed.validity().not_after.timestamp())
}

/// Read and parse a bundle; a missing file is `Ok(None)`
pub async fn read_bundle(path: &Path) -> Result<Option<LoadedCert>, CertError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => parse_bundle(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a file, retrying with a growing delay on failure
pub async fn write_with_retry(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            write_private(path, contents).await
        }
        .await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_ATTEMPTS => {
                debug!(path = %path.display(), attempt, error = %e, "Certificate write failed, retrying");
                tokio::time::sleep(WRITE_BACKOFF_STEP * attempt).await;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Certificate write failed");
                return Err(e.into());
            }
        }
    }
}

/// Write with owner-only permissions; the bundle contains the private key
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    #[cfg(unix)]
    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
    }
    #[cfg(not(unix))]
    {
        tokio::fs::write(&tmp, contents).await?;
    }
    tokio::fs::rename(&tmp, path).await
}

/// Build a bundle from a PEM certificate chain and a key pair
pub fn bundle_pem(chain_pem: &str, key: &KeyPair) -> String {
    let mut bundle = chain_pem.trim_end().to_string();
    bundle.push('\n');
    bundle.push_str(&key.serialize_pem());
    bundle
}

/// Names usable as DNS subject alternative names
fn san_names(domains: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for domain in domains {
        let stripped = domain.trim().trim_start_matches("*.").replace('*', "");
        let stripped = stripped.trim_matches('.').to_string();
        if !stripped.is_empty() && !names.contains(&stripped) {
            names.push(stripped);
        }
    }
    names
}

/// Generate a self-signed RSA-2048 certificate bundle covering `domains`,
/// valid from yesterday for 100 years
pub fn generate_self_signed(domains: &[String]) -> Result<String, CertError> {
    use rsa::pkcs8::EncodePrivateKey;

    let rsa_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
        .map_err(|e| CertError::Generation(format!("RSA key generation failed: {}", e)))?;
    let der = rsa_key
        .to_pkcs8_der()
        .map_err(|e| CertError::Generation(format!("RSA key encoding failed: {}", e)))?;
    let key_pair = KeyPair::try_from(der.as_bytes())?;

    let mut params = CertificateParams::new(san_names(domains))?;
    let common_name = domains.first().map(|d| d.trim().to_string()).unwrap_or_else(|| "*".to_string());
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);

    let yesterday = chrono::Utc::now().date_naive() - chrono::Duration::days(1);
    let (y, m, d) = {
        use chrono::Datelike;
        (yesterday.year(), yesterday.month() as u8, yesterday.day() as u8)
    };
    params.not_before = rcgen::date_time_ymd(y, m, d);
    params.not_after = rcgen::date_time_ymd(y + 100, m, d.min(28));

    let cert = params.self_signed(&key_pair)?;
    Ok(bundle_pem(&cert.pem(), &key_pair))
}

/// Short-lived ECDSA bundle for tests
#[cfg(test)]
pub(crate) fn ecdsa_bundle(domain: &str) -> String {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = CertificateParams::new(vec![domain.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    bundle_pem(&cert.pem(), &key)
}

/// ECDSA bundle whose leaf expires at the start of `year` (UTC)
#[cfg(test)]
pub(crate) fn ecdsa_bundle_expiring(domain: &str, year: i32) -> String {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(year, 1, 1);
    let cert = params.self_signed(&key).unwrap();
    bundle_pem(&cert.pem(), &key)
}

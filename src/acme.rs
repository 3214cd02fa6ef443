//! Certificate manager: ACME acquisition and the static/self-signed path
//!
//! Supports automatic certificate provisioning using:
//! - DNS-01 challenge (TXT record created through the Cloudflare API)
//! - HTTP-01 challenge (serves token at /.well-known/acme-challenge/)
//! - TLS-ALPN-01 challenge (serves certificate with acme-tls/1 ALPN)
//!
//! Only one acquisition runs at a time. Handshakes never wait for a renewal:
//! when a cached certificate is due, the renewal is queued for a background
//! worker and the cached certificate is served.
//!
//! # Key Storage
//! The ACME account key lives in the settings document and certificate private
//! keys sit next to their certificates under the certs directory, unencrypted.
//! Bundles are written with 0600 permissions on Unix.

use crate::cert_cache::CertCache;
use crate::certfile;
use crate::config::ServiceConfig;
use crate::dns::{self, CloudflareClient};
use crate::error::CertError;
use crate::renewal::{CertState, RenewalDates, SystemClock};
use crate::settings::{Entrypoint, Exitpoint, ExitpointType, Settings};
use crate::store::SettingsStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, Challenge, ChallengeType, Identifier,
    KeyAuthorization, NewAccount, NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];
const RENEWAL_QUEUE_DEPTH: usize = 32;

/// Polling cadence for ACME and DNS propagation
#[derive(Debug, Clone, Copy)]
pub struct AcmeTiming {
    pub poll_interval: Duration,
    pub validation_timeout: Duration,
    pub dns_poll_interval: Duration,
    pub dns_timeout: Duration,
}

impl Default for AcmeTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            validation_timeout: Duration::from_secs(60),
            dns_poll_interval: Duration::from_secs(1),
            dns_timeout: Duration::from_secs(60),
        }
    }
}

/// Repeated waits bounded by an overall deadline
pub struct Poller {
    interval: Duration,
    deadline: tokio::time::Instant,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            deadline: tokio::time::Instant::now() + timeout,
        }
    }

    /// Sleep one interval; false once the deadline has passed
    pub async fn wait(&self) -> bool {
        let now = tokio::time::Instant::now();
        if now >= self.deadline {
            return false;
        }
        tokio::time::sleep(self.interval.min(self.deadline - now)).await;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMethod {
    Dns01,
    Http01,
    TlsAlpn01,
}

impl ChallengeMethod {
    fn challenge_type(self) -> ChallengeType {
        match self {
            ChallengeMethod::Dns01 => ChallengeType::Dns01,
            ChallengeMethod::Http01 => ChallengeType::Http01,
            ChallengeMethod::TlsAlpn01 => ChallengeType::TlsAlpn01,
        }
    }
}

/// Pending HTTP-01 key authorizations, keyed by domain then token
#[derive(Default)]
pub struct Http01Challenges {
    inner: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, domain: &str, token: &str, key_authorization: &str) {
        self.inner
            .write()
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, domain: &str, token: &str) -> Option<String> {
        self.inner
            .read()
            .get(&domain.to_ascii_lowercase())
            .and_then(|tokens| tokens.get(token).cloned())
    }

    pub fn remove(&self, domain: &str, token: &str) {
        let mut inner = self.inner.write();
        let domain = domain.to_ascii_lowercase();
        if let Some(tokens) = inner.get_mut(&domain) {
            tokens.remove(token);
            if tokens.is_empty() {
                inner.remove(&domain);
            }
        }
    }
}

/// Most recent certificate failure, shown by the admin console
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCertError {
    pub at: DateTime<Utc>,
    pub message: String,
}

struct RenewalJob {
    domains: Vec<String>,
    method: ChallengeMethod,
}

/// A challenge response that must be withdrawn after validation
enum Presented {
    Http01 { domain: String, token: String },
    TlsAlpn01 { domain: String },
    Dns01 { client: CloudflareClient, name: String, value: String },
}

pub struct CertManager {
    store: Arc<SettingsStore>,
    certs_dir: PathBuf,
    directory_url: String,
    timing: AcmeTiming,
    cache: CertCache,
    dates: RenewalDates,
    http01: Http01Challenges,
    alpn_certs: DashMap<String, Arc<CertifiedKey>>,
    account: tokio::sync::Mutex<Option<(String, Account)>>,
    acquire_lock: tokio::sync::Mutex<()>,
    self_signed_lock: tokio::sync::Mutex<()>,
    last_error: RwLock<Option<LastCertError>>,
    renew_tx: mpsc::Sender<RenewalJob>,
}

impl CertManager {
    pub fn new(store: Arc<SettingsStore>, config: &ServiceConfig) -> Arc<Self> {
        let dates = RenewalDates::load(config.renewal_dates_path(), Arc::new(SystemClock));
        Self::with_parts(
            store,
            config.certs_dir(),
            config.acme.directory_url().to_string(),
            dates,
            AcmeTiming::default(),
        )
    }

    /// Build a manager and start its renewal worker; needs a tokio runtime
    pub fn with_parts(
        store: Arc<SettingsStore>,
        certs_dir: PathBuf,
        directory_url: String,
        dates: RenewalDates,
        timing: AcmeTiming,
    ) -> Arc<Self> {
        let (renew_tx, renew_rx) = mpsc::channel(RENEWAL_QUEUE_DEPTH);
        let manager = Arc::new(Self {
            store,
            certs_dir,
            directory_url,
            timing,
            cache: CertCache::new(),
            dates,
            http01: Http01Challenges::new(),
            alpn_certs: DashMap::new(),
            account: tokio::sync::Mutex::new(None),
            acquire_lock: tokio::sync::Mutex::new(()),
            self_signed_lock: tokio::sync::Mutex::new(()),
            last_error: RwLock::new(None),
            renew_tx,
        });
        spawn_renewal_worker(Arc::downgrade(&manager), renew_rx);
        manager
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn last_error(&self) -> Option<LastCertError> {
        self.last_error.read().clone()
    }

    fn record_error(&self, err: &CertError) {
        warn!(error = %err, "Certificate error");
        *self.last_error.write() = Some(LastCertError {
            at: Utc::now(),
            message: err.to_string(),
        });
    }

    /// Domains of `exitpoint` that may get an ACME certificate through
    /// `entrypoint`, or why none can
    pub fn eligible_domains(
        &self,
        settings: &Settings,
        entrypoint: &Entrypoint,
        exitpoint: &Exitpoint,
    ) -> Result<Vec<String>, CertError> {
        eligible_domains(settings, entrypoint, exitpoint)
    }

    /// Certificate for `host` (one of the exitpoint's host templates).
    ///
    /// A cached certificate is returned immediately and renewed in the
    /// background when due. Without a cached certificate, `allow_create`
    /// decides whether to acquire one now; the cooldown still applies.
    pub async fn get_certificate(
        &self,
        host: &str,
        entrypoint: &Entrypoint,
        exitpoint: &Exitpoint,
        allow_create: bool,
    ) -> Result<Option<Arc<CertifiedKey>>, CertError> {
        let settings = self.store.snapshot();
        let (domains, method) = match eligible_domains(&settings, entrypoint, exitpoint)
            .and_then(|d| Ok((d, challenge_method(&settings, entrypoint, exitpoint)?)))
        {
            Ok(plan) => plan,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let host = host.trim();
        let Some(domain) = domains.iter().find(|d| d.eq_ignore_ascii_case(host)) else {
            return Err(CertError::Validation(format!(
                "{} is not a domain of exitpoint {}",
                host, exitpoint.name
            )));
        };
        let path = certfile::default_cert_path(&self.certs_dir, domain);
        let current = self.cache.get(&path).await;
        if current.is_none() && !allow_create {
            return Ok(None);
        }

        let state = CertState::classify(current.as_ref().map(|c| c.not_after), self.dates.now_ms());
        let due = state
            .cooldown()
            .map_or(false, |cooldown| self.dates.try_begin(&domains, cooldown));

        match current {
            Some(cert) => {
                if due {
                    self.enqueue_renewal(domains, method);
                }
                Ok(Some(cert.key))
            }
            None if due => {
                self.acquire(&domains, method).await?;
                Ok(self.cache.reload(&path).await?.map(|c| c.key))
            }
            None => {
                debug!(domain = %domain, "Certificate acquisition is cooling down");
                Ok(None)
            }
        }
    }

    /// Hand a due renewal to the background worker. A renewal that cannot be
    /// queued releases its cooldown so a later handshake or sweep retries it.
    fn enqueue_renewal(&self, domains: Vec<String>, method: ChallengeMethod) {
        info!(domains = ?domains, "Queueing certificate renewal");
        let (job, reason) = match self.renew_tx.try_send(RenewalJob { domains, method }) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(job)) => (job, "renewal queue is full"),
            Err(mpsc::error::TrySendError::Closed(job)) => (job, "renewal worker has stopped"),
        };
        self.dates.clear(&job.domains);
        self.record_error(&CertError::Queue(format!("{}: {}", reason, job.domains.join(", "))));
    }

    /// Acquire a certificate now for an exitpoint, ignoring the cooldown.
    /// Returns the domains covered.
    pub async fn force_renew(&self, exitpoint_name: &str) -> Result<Vec<String>, CertError> {
        let settings = self.store.snapshot();
        let exitpoint = settings
            .find_exitpoint(exitpoint_name)
            .ok_or_else(|| CertError::Validation(format!("exitpoint {} does not exist", exitpoint_name)))?;

        let routed: Vec<&Entrypoint> = settings.routed_entrypoints(&exitpoint.name).collect();
        let entrypoint = routed
            .iter()
            .find(|e| e.serves_standard_ports())
            .or_else(|| routed.first().filter(|_| dns01_enabled(&settings, exitpoint)))
            .copied()
            .ok_or_else(|| {
                CertError::Validation(format!(
                    "exitpoint {} has no routed entrypoint on port 80 or 443",
                    exitpoint.name
                ))
            })?;

        let domains = eligible_domains(&settings, entrypoint, exitpoint)?;
        let method = challenge_method(&settings, entrypoint, exitpoint)?;
        self.dates.start_cooldown(&domains);
        self.acquire(&domains, method).await?;
        Ok(domains)
    }

    /// Key authorization for an HTTP-01 token, if `host` is a domain of the
    /// exitpoint and a challenge for it is pending
    pub fn http_challenge_response(
        &self,
        host: &str,
        token: &str,
        entrypoint: &Entrypoint,
        exitpoint: &Exitpoint,
    ) -> Option<String> {
        let settings = self.store.snapshot();
        let domains = eligible_domains(&settings, entrypoint, exitpoint).ok()?;
        let host = host.trim();
        if !domains.iter().any(|d| d.eq_ignore_ascii_case(host)) {
            return None;
        }
        self.http01.get(host, token)
    }

    /// In-memory TLS-ALPN-01 challenge certificate for a server name
    pub fn tls_alpn_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.alpn_certs
            .get(&server_name.to_ascii_lowercase())
            .map(|cert| cert.clone())
    }

    /// Certificate from the exitpoint's configured file, generating a
    /// self-signed one if the file is missing and generation is allowed
    pub async fn static_certificate(&self, exitpoint: &Exitpoint) -> Result<Option<Arc<CertifiedKey>>, CertError> {
        let path = self.static_cert_path(exitpoint)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if !exitpoint.allow_generate_self_signed_certificate {
                return Ok(None);
            }
            self.generate_self_signed(exitpoint, &path).await?;
        }
        Ok(self.cache.get(&path).await.map(|c| c.key))
    }

    /// The configured certificate path, or the default one, saved back into
    /// the settings
    fn static_cert_path(&self, exitpoint: &Exitpoint) -> Result<PathBuf, CertError> {
        let configured = exitpoint.certificate_path.trim();
        if !configured.is_empty() {
            return Ok(PathBuf::from(configured));
        }

        let domains = self_signed_domains(exitpoint);
        let path = certfile::default_cert_path(&self.certs_dir, &domains[0]);
        let name = exitpoint.name.clone();
        let value = path.to_string_lossy().into_owned();
        self.store.update(move |settings| {
            if let Some(e) = settings.exitpoints.iter_mut().find(|e| e.name.eq_ignore_ascii_case(&name)) {
                if e.certificate_path.trim().is_empty() {
                    e.certificate_path = value;
                }
            }
        })?;
        Ok(path)
    }

    async fn generate_self_signed(&self, exitpoint: &Exitpoint, path: &Path) -> Result<(), CertError> {
        let _guard = self.self_signed_lock.lock().await;
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        let domains = self_signed_domains(exitpoint);
        info!(exitpoint = %exitpoint.name, domains = ?domains, "Generating self-signed certificate");
        let pem = tokio::task::spawn_blocking(move || certfile::generate_self_signed(&domains))
            .await
            .map_err(|e| CertError::Generation(e.to_string()))??;

        certfile::write_with_retry(path, pem.as_bytes()).await?;
        self.cache.reload(path).await?;
        Ok(())
    }

    /// Run one ACME order for `domains`, one at a time across the process
    async fn acquire(&self, domains: &[String], method: ChallengeMethod) -> Result<(), CertError> {
        let _guard = self.acquire_lock.lock().await;
        info!(domains = ?domains, method = ?method, "Requesting certificate");

        match self.run_order(domains, method).await {
            Ok(()) => {
                info!(domains = ?domains, "Certificate obtained");
                *self.last_error.write() = None;
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn run_order(&self, domains: &[String], method: ChallengeMethod) -> Result<(), CertError> {
        let settings = self.store.snapshot();
        let account = self.account(&settings).await?;

        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == method.challenge_type())
                .ok_or_else(|| {
                    CertError::Challenge(format!("{:?} challenge not offered for {}", method, domain))
                })?;

            let key_auth = order.key_authorization(challenge);
            let presented = self.present(&settings, &domain, challenge, &key_auth, method).await?;
            let validated = async {
                order.set_challenge_ready(&challenge.url).await?;
                self.await_authorization(&mut order, &domain).await
            }
            .await;
            self.withdraw(presented).await;
            validated?;
            info!(domain = %domain, "Authorization valid");
        }

        let poller = Poller::new(self.timing.poll_interval, self.timing.validation_timeout);
        loop {
            match order.refresh().await?.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return Err(CertError::Challenge("order became invalid".to_string())),
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if !poller.wait().await {
                return Err(CertError::Challenge("order did not become ready in time".to_string()));
            }
        }

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(domains.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domains[0].clone());
        let csr = params.serialize_request(&key)?;
        order.finalize(csr.der()).await?;

        let poller = Poller::new(self.timing.poll_interval, self.timing.validation_timeout);
        let chain = loop {
            if let Some(chain) = order.certificate().await? {
                break chain;
            }
            if order.state().status == OrderStatus::Invalid {
                return Err(CertError::Challenge("order failed during finalization".to_string()));
            }
            if !poller.wait().await {
                return Err(CertError::Challenge("certificate was not issued in time".to_string()));
            }
        };

        let bundle = certfile::bundle_pem(&chain, &key);
        certfile::parse_bundle(bundle.as_bytes())?;
        for domain in domains {
            let path = certfile::default_cert_path(&self.certs_dir, domain);
            certfile::write_with_retry(&path, bundle.as_bytes()).await?;
            self.cache.reload(&path).await?;
            debug!(domain = %domain, path = %path.display(), "Certificate saved");
        }
        Ok(())
    }

    async fn present(
        &self,
        settings: &Settings,
        domain: &str,
        challenge: &Challenge,
        key_auth: &KeyAuthorization,
        method: ChallengeMethod,
    ) -> Result<Presented, CertError> {
        match method {
            ChallengeMethod::Http01 => {
                debug!(domain = %domain, token = %challenge.token, "Setting up HTTP-01 challenge");
                self.http01.set(domain, &challenge.token, key_auth.as_str());
                Ok(Presented::Http01 {
                    domain: domain.to_string(),
                    token: challenge.token.clone(),
                })
            }
            ChallengeMethod::TlsAlpn01 => {
                debug!(domain = %domain, "Setting up TLS-ALPN-01 challenge");
                let cert = create_tls_alpn01_cert(domain, key_auth.digest().as_ref())?;
                self.alpn_certs.insert(domain.to_ascii_lowercase(), cert);
                Ok(Presented::TlsAlpn01 {
                    domain: domain.to_string(),
                })
            }
            ChallengeMethod::Dns01 => {
                let client = CloudflareClient::new(&settings.cloudflare_api_token)?;
                let name = dns::acme_record_name(domain);
                let value = key_auth.dns_value();
                debug!(domain = %domain, record = %name, "Setting up DNS-01 challenge");
                client.create_txt(&name, &value).await?;

                let resolver = dns::uncached_resolver();
                dns::wait_for_txt(
                    &name,
                    &value,
                    self.timing.dns_poll_interval,
                    self.timing.dns_timeout,
                    || dns::lookup_txt(&resolver, &name),
                )
                .await;
                Ok(Presented::Dns01 { client, name, value })
            }
        }
    }

    async fn withdraw(&self, presented: Presented) {
        match presented {
            Presented::Http01 { domain, token } => self.http01.remove(&domain, &token),
            Presented::TlsAlpn01 { domain } => {
                self.alpn_certs.remove(&domain.to_ascii_lowercase());
            }
            Presented::Dns01 { client, name, value } => {
                if let Err(e) = client.delete_txt(&name, &value).await {
                    warn!(record = %name, error = %e, "Failed to delete challenge TXT record");
                }
            }
        }
    }

    async fn await_authorization(&self, order: &mut Order, domain: &str) -> Result<(), CertError> {
        let poller = Poller::new(self.timing.poll_interval, self.timing.validation_timeout);
        loop {
            let authorizations = order.authorizations().await?;
            let authz = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
                .ok_or_else(|| CertError::Challenge(format!("authorization for {} not found", domain)))?;

            match authz.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Pending => {}
                ref status => {
                    let detail = authz
                        .challenges
                        .iter()
                        .find_map(|c| c.error.as_ref())
                        .and_then(|problem| problem.detail.clone())
                        .unwrap_or_else(|| format!("{:?}", status));
                    return Err(CertError::Challenge(format!("{}: {}", domain, detail)));
                }
            }
            if !poller.wait().await {
                return Err(CertError::Challenge(format!("validation of {} timed out", domain)));
            }
        }
    }

    /// ACME account for the configured email, created and saved into the
    /// settings when missing or registered under another email
    async fn account(&self, settings: &Settings) -> Result<Account, CertError> {
        let email = settings.acme_account_email.trim().to_string();
        let mut cached = self.account.lock().await;
        if let Some((for_email, account)) = cached.as_ref() {
            if *for_email == email {
                return Ok(account.clone());
            }
        }

        let stored = settings
            .acme_account_key
            .as_ref()
            .filter(|_| settings.acme_account_key_email.trim() == email)
            .and_then(|value| match serde_json::from_value::<AccountCredentials>(value.clone()) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!(error = %e, "Stored ACME account key is unreadable, registering a new account");
                    None
                }
            });

        let account = match stored {
            Some(credentials) => {
                debug!(email = %email, "Loading ACME account");
                Account::from_credentials(credentials).await?
            }
            None => {
                info!(email = %email, directory = %self.directory_url, "Creating ACME account");
                let contact = format!("mailto:{}", email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await?;

                let value = serde_json::to_value(&credentials)
                    .map_err(|e| CertError::Generation(format!("Failed to serialize ACME account: {}", e)))?;
                let key_email = email.clone();
                self.store.update(move |s| {
                    s.acme_account_key = Some(value);
                    s.acme_account_key_email = key_email;
                })?;
                account
            }
        };

        *cached = Some((email, account.clone()));
        Ok(account)
    }
}

fn spawn_renewal_worker(manager: Weak<CertManager>, mut rx: mpsc::Receiver<RenewalJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Err(e) = manager.acquire(&job.domains, job.method).await {
                debug!(domains = ?job.domains, error = %e, "Background renewal failed");
            }
        }
    });
}

fn dns01_enabled(settings: &Settings, exitpoint: &Exitpoint) -> bool {
    exitpoint.cloudflare_dns_validation && !settings.cloudflare_api_token.trim().is_empty()
}

/// Domains of an exitpoint that may be sent to the ACME server
fn eligible_domains(
    settings: &Settings,
    entrypoint: &Entrypoint,
    exitpoint: &Exitpoint,
) -> Result<Vec<String>, CertError> {
    if settings.acme_account_email.trim().is_empty() {
        return Err(CertError::Validation("ACME account email is not configured".to_string()));
    }
    if !exitpoint.auto_certificate || exitpoint.kind == ExitpointType::Disabled {
        return Err(CertError::Validation(format!(
            "exitpoint {} does not use automatic certificates",
            exitpoint.name
        )));
    }

    let dns01 = dns01_enabled(settings, exitpoint);
    if !entrypoint.serves_standard_ports() && !dns01 {
        return Err(CertError::Validation(format!(
            "entrypoint {} must listen on HTTP port 80 or HTTPS port 443 unless DNS validation is used",
            entrypoint.name
        )));
    }

    let domains: Vec<String> = exitpoint.all_domains().into_iter().map(str::to_string).collect();
    if domains.is_empty() {
        return Err(CertError::Validation(format!("exitpoint {} has no host names", exitpoint.name)));
    }
    for domain in &domains {
        let lower = domain.to_ascii_lowercase();
        if domain.parse::<IpAddr>().is_ok() {
            return Err(CertError::Validation(format!("{} is an IP address", domain)));
        }
        if lower == "localhost" || lower.ends_with(".localhost") {
            return Err(CertError::Validation(format!("{} is a local host name", domain)));
        }
        if domain.contains('*') {
            let single_label_wildcard = domain
                .strip_prefix("*.")
                .map_or(false, |rest| !rest.is_empty() && !rest.contains('*'));
            if !dns01 || !single_label_wildcard {
                return Err(CertError::Validation(format!(
                    "{} needs DNS validation and must have the form *.example.com",
                    domain
                )));
            }
        }
    }
    Ok(domains)
}

/// DNS-01 if the exitpoint asks for it and a token exists, then HTTP-01 on
/// port 80, then TLS-ALPN-01 on port 443
fn challenge_method(
    settings: &Settings,
    entrypoint: &Entrypoint,
    exitpoint: &Exitpoint,
) -> Result<ChallengeMethod, CertError> {
    if dns01_enabled(settings, exitpoint) {
        Ok(ChallengeMethod::Dns01)
    } else if entrypoint.http_port == 80 {
        Ok(ChallengeMethod::Http01)
    } else if entrypoint.https_port == 443 {
        Ok(ChallengeMethod::TlsAlpn01)
    } else {
        Err(CertError::Validation(format!(
            "no ACME challenge is possible through entrypoint {}",
            entrypoint.name
        )))
    }
}

/// Host names for a self-signed certificate; a bare `*` when none are set
fn self_signed_domains(exitpoint: &Exitpoint) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for domain in exitpoint.all_domains() {
        if !domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
            domains.push(domain.to_string());
        }
    }
    if domains.is_empty() {
        domains.push("*".to_string());
    }
    domains
}

/// Create a TLS-ALPN-01 challenge certificate
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // acmeIdentifier: OCTET STRING holding the SHA-256 key authorization digest
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);
    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::Generation(format!("Failed to serialize private key: {}", e)))?;
    certfile::certified_key(vec![cert_der], &key_der)
}

//! Certificate renewal bookkeeping and the background renewal sweep
//!
//! Every acquisition attempt starts a per-domain cooldown that is persisted,
//! so a failing domain is not retried on each handshake or after a restart.

use crate::acme::CertManager;
use crate::store::SettingsStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const RETRY_COOLDOWN: Duration = Duration::from_secs(4 * 60 * 60);
const SLEEP_CHUNK: Duration = Duration::from_millis(250);

/// Source of wall-clock time for cooldown arithmetic
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self { now: AtomicI64::new(now_ms) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Where a certificate stands relative to its expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    /// No certificate on disk
    Absent,
    /// Expires within 1 day
    ExpiringSoon,
    /// Expires within 1 month
    ExpiringLater,
    /// More than 1 month of validity left
    Current,
}

impl CertState {
    /// Classify by expiration (`not_after` in Unix seconds)
    pub fn classify(not_after: Option<i64>, now_ms: i64) -> Self {
        let Some(not_after) = not_after else {
            return CertState::Absent;
        };
        let remaining_ms = not_after.saturating_mul(1000) - now_ms;
        if remaining_ms < DAY.as_millis() as i64 {
            CertState::ExpiringSoon
        } else if remaining_ms < MONTH.as_millis() as i64 {
            CertState::ExpiringLater
        } else {
            CertState::Current
        }
    }

    /// Minimum spacing between acquisition attempts; `None` means never renew
    pub fn cooldown(self) -> Option<Duration> {
        match self {
            CertState::Absent | CertState::ExpiringSoon => Some(RETRY_COOLDOWN),
            CertState::ExpiringLater => Some(DAY),
            CertState::Current => None,
        }
    }
}

/// Persisted map of domain to the last acquisition attempt (epoch ms)
pub struct RenewalDates {
    path: PathBuf,
    dates: Mutex<HashMap<String, i64>>,
    clock: Arc<dyn Clock>,
}

impl RenewalDates {
    /// Load the map from `path`; a missing or unreadable file starts empty
    pub fn load(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let dates = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable renewal dates");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read renewal dates");
                HashMap::new()
            }
        };
        Self {
            path,
            dates: Mutex::new(dates),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Last attempt for `domain`, epoch ms
    pub fn last_attempt(&self, domain: &str) -> Option<i64> {
        self.dates.lock().get(&domain.to_ascii_lowercase()).copied()
    }

    /// True if any domain's last attempt is older than `cooldown`
    pub fn any_off_cooldown<S: AsRef<str>>(&self, domains: &[S], cooldown: Duration) -> bool {
        let now = self.clock.now_ms();
        let dates = self.dates.lock();
        domains.iter().any(|d| off_cooldown(&dates, d.as_ref(), now, cooldown))
    }

    /// Record an attempt for every domain now
    pub fn start_cooldown<S: AsRef<str>>(&self, domains: &[S]) {
        let now = self.clock.now_ms();
        let mut dates = self.dates.lock();
        for domain in domains {
            dates.insert(domain.as_ref().to_ascii_lowercase(), now);
        }
        self.persist(&dates);
    }

    /// Atomically check the cooldown and, if any domain is due, start it on all
    pub fn try_begin<S: AsRef<str>>(&self, domains: &[S], cooldown: Duration) -> bool {
        let now = self.clock.now_ms();
        let mut dates = self.dates.lock();
        if !domains.iter().any(|d| off_cooldown(&dates, d.as_ref(), now, cooldown)) {
            return false;
        }
        for domain in domains {
            dates.insert(domain.as_ref().to_ascii_lowercase(), now);
        }
        self.persist(&dates);
        true
    }

    /// Forget the last attempt for every domain so the next check is due
    pub fn clear<S: AsRef<str>>(&self, domains: &[S]) {
        let mut dates = self.dates.lock();
        for domain in domains {
            dates.remove(&domain.as_ref().to_ascii_lowercase());
        }
        self.persist(&dates);
    }

    fn persist(&self, dates: &HashMap<String, i64>) {
        let result = serde_json::to_vec_pretty(dates)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let tmp = self.path.with_extension("tmp");
                std::fs::write(&tmp, json)?;
                std::fs::rename(&tmp, &self.path)
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to save renewal dates");
        }
    }
}

fn off_cooldown(dates: &HashMap<String, i64>, domain: &str, now: i64, cooldown: Duration) -> bool {
    match dates.get(&domain.to_ascii_lowercase()) {
        Some(&last) => now - last >= cooldown.as_millis() as i64,
        None => true,
    }
}

/// Periodic sweep asking the certificate manager about every auto-cert domain
pub struct RenewalScheduler {
    manager: Arc<CertManager>,
    store: Arc<SettingsStore>,
    startup_delay: Duration,
    interval: Duration,
    abort: Arc<AtomicBool>,
}

impl RenewalScheduler {
    pub fn new(
        manager: Arc<CertManager>,
        store: Arc<SettingsStore>,
        startup_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            store,
            startup_delay,
            interval,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the scheduler at its next check
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Visit every auto-cert exitpoint once; renewals run on the manager's
    /// background worker
    pub async fn sweep_once(&self) {
        let settings = self.store.snapshot();
        debug!("Certificate renewal sweep started");

        for exitpoint in settings.exitpoints.iter().filter(|e| e.auto_certificate) {
            let routed: Vec<_> = settings.routed_entrypoints(&exitpoint.name).collect();
            let Some(entrypoint) = routed
                .iter()
                .find(|e| e.serves_standard_ports())
                .or_else(|| routed.first())
                .copied()
            else {
                continue;
            };

            let domains = match self.manager.eligible_domains(&settings, entrypoint, exitpoint) {
                Ok(domains) => domains,
                Err(e) => {
                    debug!(exitpoint = %exitpoint.name, error = %e, "Skipping renewal");
                    continue;
                }
            };

            for domain in &domains {
                if self.aborted() {
                    return;
                }
                if let Err(e) = self
                    .manager
                    .get_certificate(domain, entrypoint, exitpoint, false)
                    .await
                {
                    debug!(domain = %domain, error = %e, "Renewal check failed");
                }
            }
        }
    }

    /// Run until shutdown or abort: wait the startup delay, then sweep every
    /// interval
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            startup_delay_secs = self.startup_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Certificate renewal scheduler started"
        );
        let mut delay = self.startup_delay;
        loop {
            if !self.sleep(delay, &mut shutdown).await {
                break;
            }
            self.sweep_once().await;
            delay = self.interval;
        }
        info!("Certificate renewal scheduler stopped");
    }

    /// Sleep in short chunks; false if stopped while waiting
    async fn sleep(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.aborted() || *shutdown.borrow() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let step = SLEEP_CHUNK.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

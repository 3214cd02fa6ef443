//! Lazily loaded, TTL-bounded certificate cache keyed by file path
//!
//! An entry older than the soft TTL is refreshed in the background while
//! readers keep getting the current value. Past the hard TTL the reader waits
//! for the reload.

use crate::certfile::{self, LoadedCert};
use crate::error::CertError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const SOFT_TTL: Duration = Duration::from_secs(60);
pub const HARD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct CertCache {
    entries: DashMap<PathBuf, Arc<CacheEntry>>,
    soft_ttl: Duration,
    hard_ttl: Duration,
}

impl Default for CertCache {
    fn default() -> Self {
        Self::with_ttls(SOFT_TTL, HARD_TTL)
    }
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttls(soft_ttl: Duration, hard_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            soft_ttl,
            hard_ttl,
        }
    }

    /// The cached certificate at `path`, loading it on first use.
    /// Missing or unreadable files yield `None`.
    pub async fn get(&self, path: &Path) -> Option<LoadedCert> {
        self.entry(path).get(self.soft_ttl, self.hard_ttl).await
    }

    /// Reload from disk now, reporting read and parse failures
    pub async fn reload(&self, path: &Path) -> Result<Option<LoadedCert>, CertError> {
        self.entry(path).reload().await
    }

    fn entry(&self, path: &Path) -> Arc<CacheEntry> {
        if let Some(entry) = self.entries.get(path) {
            return entry.clone();
        }
        self.entries
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(CacheEntry::new(path.to_path_buf())))
            .clone()
    }
}

struct CacheEntry {
    path: PathBuf,
    state: RwLock<EntryState>,
    load_lock: tokio::sync::Mutex<()>,
    reloading: AtomicBool,
}

#[derive(Default)]
struct EntryState {
    value: Option<LoadedCert>,
    loaded_at: Option<Instant>,
}

impl CacheEntry {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(EntryState::default()),
            load_lock: tokio::sync::Mutex::new(()),
            reloading: AtomicBool::new(false),
        }
    }

    async fn get(self: Arc<Self>, soft_ttl: Duration, hard_ttl: Duration) -> Option<LoadedCert> {
        let (value, age) = {
            let state = self.state.read();
            (state.value.clone(), state.loaded_at.map(|t| t.elapsed()))
        };

        match age {
            None => self.load_lenient().await,
            Some(age) if age >= hard_ttl => self.load_lenient().await,
            Some(age) if age >= soft_ttl => {
                if !self.reloading.swap(true, Ordering::AcqRel) {
                    let entry = self.clone();
                    tokio::spawn(async move {
                        entry.load_lenient().await;
                        entry.reloading.store(false, Ordering::Release);
                    });
                }
                value
            }
            Some(_) => value,
        }
    }

    /// Reload, keeping the previous value if the file cannot be read
    async fn load_lenient(&self) -> Option<LoadedCert> {
        match self.reload().await {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to load certificate");
                let mut state = self.state.write();
                state.loaded_at = Some(Instant::now());
                state.value.clone()
            }
        }
    }

    async fn reload(&self) -> Result<Option<LoadedCert>, CertError> {
        let _guard = self.load_lock.lock().await;
        let loaded = certfile::read_bundle(&self.path).await?;
        debug!(path = %self.path.display(), found = loaded.is_some(), "Certificate loaded");
        let mut state = self.state.write();
        state.value = loaded.clone();
        state.loaded_at = Some(Instant::now());
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certfile::ecdsa_bundle;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertCache::new();
        assert!(cache.get(&dir.path().join("absent.pem")).await.is_none());
        assert!(cache.reload(&dir.path().join("absent.pem")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pem");
        std::fs::write(&path, "garbage").unwrap();

        let cache = CertCache::new();
        assert!(cache.get(&path).await.is_none());
        assert!(cache.reload(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_soft_ttl_serves_stale_then_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pem");
        std::fs::write(&path, ecdsa_bundle("app.test")).unwrap();

        let cache = CertCache::with_ttls(Duration::from_millis(50), HARD_TTL);
        let first = cache.get(&path).await.unwrap();

        std::fs::write(&path, ecdsa_bundle("app.test")).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Stale value first; the background reload swaps in the new file.
        let stale = cache.get(&path).await.unwrap();
        assert!(Arc::ptr_eq(&first.key, &stale.key));

        let mut refreshed = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = cache.get(&path).await.unwrap();
            if !Arc::ptr_eq(&first.key, &current.key) {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed, "background reload never completed");
    }

    #[tokio::test]
    async fn test_hard_ttl_reloads_inline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pem");
        std::fs::write(&path, ecdsa_bundle("app.test")).unwrap();

        let cache = CertCache::with_ttls(Duration::from_millis(10), Duration::from_millis(30));
        assert!(cache.get(&path).await.is_some());

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_fresh_entry_is_not_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pem");
        std::fs::write(&path, ecdsa_bundle("app.test")).unwrap();

        let cache = CertCache::new();
        assert!(cache.get(&path).await.is_some());
        std::fs::remove_file(&path).unwrap();
        assert!(cache.get(&path).await.is_some());
    }
}

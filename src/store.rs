//! Copy-on-write settings store
//!
//! Readers call [`SettingsStore::snapshot`] and get an `Arc<Settings>` that
//! never changes underneath them. Writers serialize on a save lock, validate a
//! detached copy, publish it with an atomic swap and then persist it.

use crate::error::SettingsError;
use crate::settings::Settings;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct SettingsStore {
    current: ArcSwap<Settings>,
    path: PathBuf,
    save_lock: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl SettingsStore {
    /// Load settings from `path`, creating defaults when the file is missing.
    ///
    /// The loaded graph is validated and the admin console is repaired; if
    /// either changed anything the file is rewritten.
    pub fn load_or_init(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let (mut settings, existed) = match std::fs::read(&path) {
            Ok(bytes) => (serde_json::from_slice::<Settings>(&bytes)?, true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Settings::default(), false),
            Err(e) => return Err(e.into()),
        };

        let before = settings.clone();
        repair_admin_console(&mut settings);
        settings.validate()?;

        let store = Self::in_memory_at(settings.clone(), path);
        if !existed || settings != before {
            store.persist(&settings)?;
        }
        Ok(store)
    }

    /// A store that publishes `settings` without reading from disk
    pub fn in_memory_at(settings: Settings, path: impl Into<PathBuf>) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(settings),
            path: path.into(),
            save_lock: Mutex::new(()),
            version_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The currently published settings
    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Subscribe to publish notifications; the value is a save counter
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Validate and publish a new settings graph, then write it to disk
    pub fn save(&self, settings: Settings) -> Result<Arc<Settings>, SettingsError> {
        let _guard = self.save_lock.lock();
        self.publish_locked(settings)
    }

    /// Clone the current snapshot, apply `edit`, and save the result.
    ///
    /// The save lock is held across the whole read-modify-write so concurrent
    /// updates cannot lose each other's edits.
    pub fn update<F>(&self, edit: F) -> Result<Arc<Settings>, SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.save_lock.lock();
        let mut settings = Settings::clone(&self.current.load());
        edit(&mut settings);
        self.publish_locked(settings)
    }

    /// Re-read the settings file and publish it when it differs from the live
    /// snapshot. Returns whether anything changed.
    pub fn reload_from_disk(&self) -> Result<bool, SettingsError> {
        let _guard = self.save_lock.lock();
        let mut settings: Settings = serde_json::from_slice(&std::fs::read(&self.path)?)?;
        repair_admin_console(&mut settings);
        settings.validate()?;
        if settings == *self.current.load_full() {
            return Ok(false);
        }
        self.publish_locked(settings)?;
        Ok(true)
    }

    /// Caller holds the save lock
    fn publish_locked(&self, mut settings: Settings) -> Result<Arc<Settings>, SettingsError> {
        settings.validate()?;
        let published = Arc::new(settings);
        self.current.store(published.clone());
        self.version_tx.send_modify(|v| *v += 1);
        self.persist(&published)?;
        Ok(published)
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(settings)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;

        if let Err(e) = self.write_backup(&json) {
            warn!(error = %e, "Failed to write settings backup");
        }
        Ok(())
    }

    fn write_backup(&self, json: &[u8]) -> std::io::Result<()> {
        let dir = self
            .path
            .parent()
            .map(|p| p.join("settings_backup"))
            .unwrap_or_else(|| PathBuf::from("settings_backup"));
        std::fs::create_dir_all(&dir)?;
        let name = format!(
            "Settings-{}.json",
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S_%3f")
        );
        std::fs::write(dir.join(name), json)
    }
}

fn repair_admin_console(settings: &mut Settings) {
    let repair = settings.ensure_admin_console();
    if let Some(password) = &repair.generated_password {
        info!(
            user = crate::settings::ADMIN_CONSOLE_USER,
            password = %password,
            "Generated admin console login; change it after signing in"
        );
    }
}

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Service bootstrap configuration.
///
/// Everything that describes routing lives in the JSON settings document under
/// `data_dir`; this file only says where that document is and how the service
/// itself behaves.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Directory holding settings, renewal dates, certificates and backups
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default tracing filter, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub renewal: RenewalConfig,
}

/// ACME directory selection
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AcmeConfig {
    /// ACME directory URL (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging directory when no URL is given
    #[serde(default)]
    pub staging: bool,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }
}

/// Background renewal sweep timing
#[derive(Debug, Deserialize, Clone)]
pub struct RenewalConfig {
    /// Hours between sweeps (minimum 1)
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Delay before the first sweep after startup
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            startup_delay_secs: default_startup_delay(),
        }
    }
}

impl RenewalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_filter: default_log_filter(),
            acme: AcmeConfig::default(),
            renewal: RenewalConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_filter() -> String {
    "routegate=info".to_string()
}

fn default_interval_hours() -> u64 {
    4
}

fn default_startup_delay() -> u64 {
    300
}

impl ServiceConfig {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: ServiceConfig = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServiceConfig::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }
        if self.renewal.interval_hours < 1 {
            errors.push("renewal.interval_hours must be at least 1".to_string());
        }
        if let Some(url) = &self.acme.directory_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                errors.push(format!("acme.directory_url is not an HTTP(S) URL: {}", url));
            }
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.log_filter) {
            errors.push(format!("log_filter is invalid: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn renewal_dates_path(&self) -> PathBuf {
        self.data_dir.join("cert_renewal_dates.json")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
data_dir = "/var/lib/routegate"
log_filter = "routegate=debug"

[acme]
staging = true

[renewal]
interval_hours = 12
startup_delay_secs = 30
"#;

        let config: ServiceConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/routegate"));
        assert_eq!(config.acme.directory_url(), LETS_ENCRYPT_STAGING);
        assert_eq!(config.renewal.interval(), Duration::from_secs(12 * 3600));
        assert_eq!(config.renewal.startup_delay(), Duration::from_secs(30));
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/var/lib/routegate/settings.json")
        );
    }

    #[test]
    fn test_empty_config() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.log_filter, "routegate=info");
        assert_eq!(config.acme.directory_url(), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.renewal.interval_hours, 4);
        assert_eq!(config.renewal.startup_delay_secs, 300);
    }

    #[test]
    fn test_explicit_directory_url_wins_over_staging() {
        let config: ServiceConfig = toml::from_str(
            r#"
[acme]
staging = true
directory_url = "https://localhost:14000/dir"
"#,
        )
        .unwrap();
        assert_eq!(config.acme.directory_url(), "https://localhost:14000/dir");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config: ServiceConfig = toml::from_str(
            r#"
[acme]
directory_url = "ftp://example.com"

[renewal]
interval_hours = 0
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("interval_hours"));
        assert!(err.contains("directory_url"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.renewal.interval_hours, 4);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routegate.toml");
        std::fs::write(&path, "data_dir = [").unwrap();
        assert!(ServiceConfig::load(&path).is_err());
    }
}

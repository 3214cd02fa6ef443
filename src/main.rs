use routegate::acme::CertManager;
use routegate::admin::{PKG_NAME, VERSION};
use routegate::config::ServiceConfig;
use routegate::proxy::ProxyServer;
use routegate::renewal::RenewalScheduler;
use routegate::store::SettingsStore;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routegate.toml"));

    let config = ServiceConfig::load(&config_path)?;

    // Initialize logging; RUST_LOG overrides the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create data directory '{}': {}", config.data_dir.display(), e)
    })?;

    let store = Arc::new(SettingsStore::load_or_init(config.settings_path()).map_err(|e| {
        error!(path = %config.settings_path().display(), error = %e, "Failed to load settings");
        anyhow::anyhow!("Failed to load settings: {}", e)
    })?);
    {
        let settings = store.snapshot();
        info!(
            entrypoints = settings.entrypoints.len(),
            exitpoints = settings.exitpoints.len(),
            middlewares = settings.middlewares.len(),
            proxy_routes = settings.proxy_routes.len(),
            "Settings loaded"
        );
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let certs = CertManager::new(Arc::clone(&store), &config);

    let scheduler = RenewalScheduler::new(
        Arc::clone(&certs),
        Arc::clone(&store),
        config.renewal.startup_delay(),
        config.renewal.interval(),
    );
    let scheduler_abort = scheduler.abort_handle();
    let renewal_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let proxy = ProxyServer::new(Arc::clone(&store), Arc::clone(&certs));
    let proxy_shutdown = shutdown_rx.clone();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run(proxy_shutdown).await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or settings reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %store.path().display(), "Received SIGHUP, reloading settings...");
                    match store.reload_from_disk() {
                        Ok(true) => info!("Settings reloaded"),
                        Ok(false) => info!("Settings unchanged"),
                        Err(e) => error!(error = %e, "Failed to reload settings"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    scheduler_abort.store(true, Ordering::SeqCst);

    // Wait for tasks to stop (with timeout)
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = renewal_handle.await;
    })
    .await;
    if stopped.is_err() {
        warn!("Timed out waiting for background tasks to stop");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &ServiceConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting reverse proxy");
    info!(
        data_dir = %config.data_dir.display(),
        acme_directory = config.acme.directory_url(),
        "Service configuration"
    );
    info!(
        interval_hours = config.renewal.interval_hours,
        startup_delay_secs = config.renewal.startup_delay_secs,
        "Certificate renewal settings"
    );
}

//! Upstream HTTP clients
//!
//! Exitpoints with the same certificate, keep-alive and connect-timeout
//! settings share one `reqwest` client and with it one connection pool.

use crate::settings::Exitpoint;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 32;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build upstream client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Statistics for upstream traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests sent upstream
    pub total_requests: AtomicU64,
    /// Requests that failed to connect or timed out
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Client settings that require a separate connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub accept_any_certificate: bool,
    pub keep_alive: bool,
    pub connect_timeout: Duration,
}

impl ClientKey {
    pub fn for_exitpoint(exitpoint: &Exitpoint) -> Self {
        Self {
            accept_any_certificate: exitpoint.proxy_accept_any_certificate,
            keep_alive: exitpoint.use_connection_keep_alive,
            connect_timeout: Duration::from_secs(u64::from(exitpoint.connect_timeout_sec.max(1))),
        }
    }
}

#[derive(Default)]
pub struct UpstreamPool {
    clients: DashMap<ClientKey, reqwest::Client>,
    stats: Arc<PoolStats>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Shared client for an exitpoint, built on first use
    pub fn client_for(&self, exitpoint: &Exitpoint) -> Result<reqwest::Client, PoolError> {
        let key = ClientKey::for_exitpoint(exitpoint);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(key)?;
        debug!(
            accept_any_certificate = key.accept_any_certificate,
            keep_alive = key.keep_alive,
            connect_timeout_secs = key.connect_timeout.as_secs(),
            "Upstream client created"
        );
        Ok(self.clients.entry(key).or_insert(client).clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn build_client(key: ClientKey) -> Result<reqwest::Client, PoolError> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(key.connect_timeout)
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(key.accept_any_certificate);

    builder = if key.keep_alive {
        builder
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
    } else {
        builder.pool_max_idle_per_host(0)
    };

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ExitpointType;

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_clients_shared_by_key() {
        let pool = UpstreamPool::new();
        let a = Exitpoint::new("A", "a.test", ExitpointType::WebProxy);
        let b = Exitpoint::new("B", "b.test", ExitpointType::WebProxy);
        let mut insecure = Exitpoint::new("C", "c.test", ExitpointType::WebProxy);
        insecure.proxy_accept_any_certificate = true;

        pool.client_for(&a).unwrap();
        pool.client_for(&b).unwrap();
        assert_eq!(pool.client_count(), 1);

        pool.client_for(&insecure).unwrap();
        assert_eq!(pool.client_count(), 2);
    }

    #[test]
    fn test_client_key_clamps_zero_timeout() {
        let mut exit = Exitpoint::new("A", "a.test", ExitpointType::WebProxy);
        exit.connect_timeout_sec = 0;
        assert_eq!(ClientKey::for_exitpoint(&exit).connect_timeout, Duration::from_secs(1));
    }
}

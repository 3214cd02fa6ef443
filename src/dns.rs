//! Cloudflare DNS client for DNS-01 validation
//!
//! Only the TXT record operations needed for ACME are covered. Propagation is
//! checked against Cloudflare's public resolvers with caching disabled.

use crate::error::DnsError;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";
const ZONE_PAGE_SIZE: u32 = 50;
const TXT_TTL: u32 = 60;
const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";
const ACCESS_TEST_LABEL: &str = "_test-access-token";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

/// Record name holding the DNS-01 token for a domain; wildcard markers are dropped
pub fn acme_record_name(domain: &str) -> String {
    let base = domain.trim().trim_start_matches("*.").trim_end_matches('.');
    format!("{}.{}", ACME_CHALLENGE_LABEL, base)
}

/// The zone with the longest name that is `domain` or a parent of it
pub fn best_zone<'a>(zones: &'a [Zone], domain: &str) -> Option<&'a Zone> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    zones
        .iter()
        .filter(|zone| {
            let zone = zone.name.to_ascii_lowercase();
            domain == zone || domain.ends_with(&format!(".{}", zone))
        })
        .max_by_key(|zone| zone.name.split('.').count())
}

#[derive(Clone)]
pub struct CloudflareClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl CloudflareClient {
    pub fn new(token: &str) -> Result<Self, DnsError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DnsError::MissingToken);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            token: token.to_string(),
            base_url: CLOUDFLARE_API.to_string(),
        })
    }

    /// Point the client at another API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Every zone visible to the token
    pub async fn zones(&self) -> Result<Vec<Zone>, DnsError> {
        let mut zones = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{}/zones?per_page={}&page={}", self.base_url, ZONE_PAGE_SIZE, page);
            let envelope: ApiEnvelope<Vec<Zone>> = self.send(self.http.get(url)).await?;
            let batch = envelope.result.unwrap_or_default();
            let fetched = batch.len();
            zones.extend(batch);

            let info = envelope.result_info.unwrap_or_default();
            if fetched < ZONE_PAGE_SIZE as usize || info.page >= info.total_pages {
                break;
            }
            page += 1;
        }
        debug!(count = zones.len(), "Fetched DNS zones");
        Ok(zones)
    }

    pub async fn zone_for(&self, domain: &str) -> Result<Zone, DnsError> {
        let zones = self.zones().await?;
        best_zone(&zones, domain)
            .cloned()
            .ok_or_else(|| DnsError::NoZone(domain.to_string()))
    }

    /// Name of the first zone (by name) that has name servers assigned
    pub async fn any_configured_domain(&self) -> Result<Option<String>, DnsError> {
        let mut zones = self.zones().await?;
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(zones
            .into_iter()
            .find(|z| !z.name_servers.is_empty())
            .map(|z| z.name))
    }

    pub async fn create_txt(&self, name: &str, content: &str) -> Result<(), DnsError> {
        let zone = self.zone_for(name).await?;
        let url = format!("{}/zones/{}/dns_records", self.base_url, zone.id);
        let body = serde_json::json!({
            "type": "TXT",
            "name": name,
            "content": content,
            "ttl": TXT_TTL,
        });
        let _: ApiEnvelope<DnsRecord> = self.send(self.http.post(url).json(&body)).await?;
        info!(record = %name, zone = %zone.name, "Created TXT record");
        Ok(())
    }

    /// Delete TXT records named `name` holding `content`; returns how many
    pub async fn delete_txt(&self, name: &str, content: &str) -> Result<usize, DnsError> {
        self.delete_matching(name, Some(content)).await
    }

    /// Delete every TXT record named `name`; returns how many
    pub async fn delete_txt_all(&self, name: &str) -> Result<usize, DnsError> {
        self.delete_matching(name, None).await
    }

    async fn delete_matching(&self, name: &str, content: Option<&str>) -> Result<usize, DnsError> {
        let zone = self.zone_for(name).await?;
        let records_url = format!("{}/zones/{}/dns_records", self.base_url, zone.id);

        let mut query = vec![("type", "TXT"), ("name", name)];
        if let Some(content) = content {
            query.push(("content", content));
        }
        let envelope: ApiEnvelope<Vec<DnsRecord>> =
            self.send(self.http.get(&records_url).query(&query)).await?;

        let records = envelope.result.unwrap_or_default();
        for record in &records {
            let url = format!("{}/{}", records_url, record.id);
            let _: ApiEnvelope<serde_json::Value> = self.send(self.http.delete(url)).await?;
        }
        debug!(record = %name, deleted = records.len(), "Deleted TXT records");
        Ok(records.len())
    }

    /// Create and remove a throwaway TXT record to prove the token can edit DNS.
    /// Returns the zone used.
    pub async fn test_access(&self) -> Result<String, DnsError> {
        let domain = self
            .any_configured_domain()
            .await?
            .ok_or_else(|| DnsError::NoZone("any configured domain".to_string()))?;
        let name = format!("{}.{}", ACCESS_TEST_LABEL, domain);
        let value = uuid::Uuid::new_v4().to_string();

        self.create_txt(&name, &value).await?;
        let deleted = self.delete_txt_all(&name).await?;
        if deleted == 0 {
            return Err(DnsError::Api(format!("test record {} was not found after creation", name)));
        }
        Ok(domain)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<ApiEnvelope<T>, DnsError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let envelope: ApiEnvelope<T> = response.json().await?;
        if !status.is_success() || !envelope.success {
            let messages: Vec<String> = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect();
            return Err(DnsError::Api(format!("HTTP {}: {}", status.as_u16(), messages.join("; "))));
        }
        Ok(envelope)
    }
}

/// Resolver against Cloudflare's public DNS with caching disabled
pub fn uncached_resolver() -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts)
}

/// Current TXT values for `name`
pub async fn lookup_txt(resolver: &TokioAsyncResolver, name: &str) -> Result<Vec<String>, DnsError> {
    let lookup = resolver
        .txt_lookup(name)
        .await
        .map_err(|e| DnsError::Resolve(e.to_string()))?;
    Ok(lookup
        .iter()
        .map(|txt| {
            txt.txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk))
                .collect::<String>()
        })
        .collect())
}

/// Poll `lookup` until it reports `expected` or `timeout` passes.
///
/// Returns whether the value was seen; lookup errors count as "not yet".
pub async fn wait_for_txt<F, Fut>(
    name: &str,
    expected: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut lookup: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<String>, DnsError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match lookup().await {
            Ok(values) if values.iter().any(|v| v == expected) => {
                debug!(record = %name, "TXT record visible");
                return true;
            }
            Ok(_) => {}
            Err(e) => debug!(record = %name, error = %e, "TXT lookup failed"),
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            warn!(record = %name, "TXT record not visible before timeout");
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

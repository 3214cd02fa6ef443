//! JSON API served by the `AdminConsole` exitpoint
//!
//! Requests arrive here only after routing and the middleware pipeline, so the
//! admin login middleware has already authenticated the caller.

use crate::acme::CertManager;
use crate::dns::CloudflareClient;
use crate::error::{full_body, json_error_response, BoxError, CertError, ProxyBody, ProxyErrorCode};
use crate::pool::PoolStats;
use crate::settings::Settings;
use crate::store::SettingsStore;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn api_success(mut body: serde_json::Value) -> Response<ProxyBody> {
    if let Some(map) = body.as_object_mut() {
        map.insert("success".to_string(), serde_json::Value::Bool(true));
    }
    json_response(StatusCode::OK, body)
}

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> Response<ProxyBody> {
    json_response(
        status,
        serde_json::json!({ "success": false, "error": message.to_string() }),
    )
}

fn cert_error_status(err: &CertError) -> StatusCode {
    match err {
        CertError::Validation(_) => StatusCode::BAD_REQUEST,
        CertError::Challenge(_) | CertError::Transport(_) => StatusCode::BAD_GATEWAY,
        CertError::FileIo(_) | CertError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CertError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceRenewRequest {
    exitpoint_name: String,
}

pub struct AdminApi {
    store: Arc<SettingsStore>,
    certs: Arc<CertManager>,
    stats: Arc<PoolStats>,
    started: Instant,
}

impl AdminApi {
    pub fn new(store: Arc<SettingsStore>, certs: Arc<CertManager>, stats: Arc<PoolStats>) -> Self {
        Self {
            store,
            certs,
            stats,
            started: Instant::now(),
        }
    }

    /// Answer one admin request. `user` is the login the pipeline accepted.
    pub async fn handle<B>(&self, req: Request<B>, user: Option<&str>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, user = user.unwrap_or("-"), "Admin API request");

        match (&method, path.as_str()) {
            (&Method::GET, "/api/status") => self.status(),
            (&Method::GET, "/api/configuration") => self.configuration(),
            (&Method::POST, "/api/configuration") => match read_body(req).await {
                Ok(body) => self.save_configuration(&body, user),
                Err(resp) => resp,
            },
            (&Method::POST, "/api/force-renew") => match read_body(req).await {
                Ok(body) => self.force_renew(&body).await,
                Err(resp) => resp,
            },
            (&Method::POST, "/api/test-dns") => self.test_dns().await,
            _ => json_error_response(ProxyErrorCode::NotFound, format!("Unknown path: {}", path)),
        }
    }

    fn status(&self) -> Response<ProxyBody> {
        let settings = self.store.snapshot();
        api_success(serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "uptimeSecs": self.started.elapsed().as_secs(),
            "entrypoints": settings.entrypoints.len(),
            "exitpoints": settings.exitpoints.len(),
            "middlewares": settings.middlewares.len(),
            "proxyRoutes": settings.proxy_routes.len(),
            "upstream": {
                "totalRequests": self.stats.get_total_requests(),
                "failedRequests": self.stats.get_failed_requests(),
            },
            "lastCertificateError": self.certs.last_error(),
        }))
    }

    fn configuration(&self) -> Response<ProxyBody> {
        match serde_json::to_value(&*self.store.snapshot()) {
            Ok(settings) => api_success(serde_json::json!({ "settings": settings })),
            Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }

    fn save_configuration(&self, body: &[u8], user: Option<&str>) -> Response<ProxyBody> {
        let mut settings: Settings = match serde_json::from_slice(body) {
            Ok(settings) => settings,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid settings JSON: {}", e)),
        };

        // Credentials stay with the server unless the caller replaces them.
        let current = self.store.snapshot();
        if settings.acme_account_key.is_none() && settings.acme_account_email == current.acme_account_email {
            settings.acme_account_key = current.acme_account_key.clone();
            settings.acme_account_key_email = current.acme_account_key_email.clone();
        }

        let repair = settings.ensure_admin_console();
        if let Some(password) = &repair.generated_password {
            info!(
                user = crate::settings::ADMIN_CONSOLE_USER,
                password = %password,
                "Admin console login was missing and has been recreated"
            );
        }

        match self.store.save(settings) {
            Ok(saved) => {
                info!(user = user.unwrap_or("-"), exitpoints = saved.exitpoints.len(), "Settings saved from admin console");
                api_success(serde_json::json!({ "repaired": repair.changed }))
            }
            Err(e) => {
                warn!(error = %e, "Rejected settings from admin console");
                api_error(StatusCode::BAD_REQUEST, e)
            }
        }
    }

    async fn force_renew(&self, body: &[u8]) -> Response<ProxyBody> {
        let request: ForceRenewRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid request: {}", e)),
        };

        info!(exitpoint = %request.exitpoint_name, "Forced certificate renewal requested");
        match self.certs.force_renew(&request.exitpoint_name).await {
            Ok(domains) => api_success(serde_json::json!({ "domains": domains })),
            Err(e) => api_error(cert_error_status(&e), e),
        }
    }

    async fn test_dns(&self) -> Response<ProxyBody> {
        let settings = self.store.snapshot();
        let client = match CloudflareClient::new(&settings.cloudflare_api_token) {
            Ok(client) => client,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
        };
        match client.test_access().await {
            Ok(zone) => {
                info!(zone = %zone, "DNS provider token verified");
                api_success(serde_json::json!({ "zone": zone }))
            }
            Err(e) => {
                warn!(error = %e, "DNS provider token check failed");
                api_error(StatusCode::BAD_GATEWAY, e)
            }
        }
    }
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, Response<ProxyBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(json_error_response(
            ProxyErrorCode::BadRequest,
            format!("Failed to read request body: {}", e),
        )),
    }
}

//! The network server: listeners, TLS handshakes and request dispatch
//!
//! Listeners are derived from the entrypoints and reconciled whenever the
//! settings change. Every connection is routed twice: once with the TLS server
//! name to pick a certificate, and once per request with the Host header.

use crate::acme::CertManager;
use crate::admin::AdminApi;
use crate::digest::DigestAuth;
use crate::error::{full_body, json_error_response, BoxError, ProxyBody, ProxyErrorCode};
use crate::middleware::{self, DispatchPlan, PipelineOutcome, RequestContext};
use crate::pool::UpstreamPool;
use crate::routing::{self, Route};
use crate::settings::{Exitpoint, ExitpointType, Settings, TlsCipherSuiteSet};
use crate::store::SettingsStore;
use crate::tls;
use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// First byte of a TLS handshake record
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Connection-scoped headers never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returned by the request service to close the connection without answering
#[derive(Debug, Error)]
#[error("connection closed without response")]
pub struct ConnectionDropped;

/// A socket the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Binding {
    /// Every interface, IPv4 and IPv6
    AnyInterface(u16),
    Interface(SocketAddr),
}

/// The sockets needed to serve every enabled entrypoint port.
///
/// A port that any entrypoint serves on every interface is bound only once as
/// [`Binding::AnyInterface`]; entrypoints bound to a specific address on that
/// port are told apart by the connection's local address instead.
pub fn compute_bindings(settings: &Settings) -> BTreeSet<Binding> {
    let mut any_ports = BTreeSet::new();
    let mut specific = BTreeSet::new();

    for entrypoint in &settings.entrypoints {
        let ip = entrypoint
            .ip_address
            .trim()
            .parse::<IpAddr>()
            .ok()
            .map(|ip| ip.to_canonical())
            .filter(|ip| !ip.is_unspecified());
        for port in [entrypoint.http_port, entrypoint.https_port] {
            if port == 0 {
                continue;
            }
            match ip {
                Some(ip) => specific.insert(SocketAddr::new(ip, port)),
                None => any_ports.insert(port),
            };
        }
    }

    let mut bindings: BTreeSet<Binding> = any_ports.iter().map(|&p| Binding::AnyInterface(p)).collect();
    bindings.extend(
        specific
            .into_iter()
            .filter(|addr| !any_ports.contains(&addr.port()))
            .map(Binding::Interface),
    );
    bindings
}

/// Bind the listeners for one binding. On hosts where the IPv6 wildcard socket
/// is dual-stack the IPv4 bind fails and the IPv6 socket serves both.
pub async fn bind(binding: Binding) -> std::io::Result<Vec<TcpListener>> {
    match binding {
        Binding::Interface(addr) => Ok(vec![TcpListener::bind(addr).await?]),
        Binding::AnyInterface(port) => {
            let v6 = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await;
            let v4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await;
            match (v6, v4) {
                (Ok(v6), Ok(v4)) => Ok(vec![v6, v4]),
                (Ok(v6), Err(_)) => Ok(vec![v6]),
                (Err(e), Ok(v4)) => {
                    debug!(port, error = %e, "IPv6 wildcard bind failed, serving IPv4 only");
                    Ok(vec![v4])
                }
                (Err(e), Err(_)) => Err(e),
            }
        }
    }
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Addresses of one accepted connection
#[derive(Debug, Clone, Copy)]
struct ConnectionInfo {
    peer: SocketAddr,
    local: SocketAddr,
    secure: bool,
}

struct ConnectionLimit {
    max: u32,
    semaphore: Arc<Semaphore>,
}

impl ConnectionLimit {
    fn new(max: u32) -> Self {
        Self {
            max,
            semaphore: Arc::new(Semaphore::new(max as usize)),
        }
    }
}

/// The reverse proxy server
pub struct ProxyServer {
    store: Arc<SettingsStore>,
    certs: Arc<CertManager>,
    pool: UpstreamPool,
    digest: DigestAuth,
    admin: AdminApi,
    limit: Mutex<ConnectionLimit>,
}

impl ProxyServer {
    pub fn new(store: Arc<SettingsStore>, certs: Arc<CertManager>) -> Arc<Self> {
        let pool = UpstreamPool::new();
        let admin = AdminApi::new(store.clone(), certs.clone(), pool.stats());
        let max = store.snapshot().server_max_connection_count;
        Arc::new(Self {
            store,
            certs,
            pool,
            digest: DigestAuth::new(),
            admin,
            limit: Mutex::new(ConnectionLimit::new(max)),
        })
    }

    /// Get the upstream pool (for statistics)
    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    /// Keep one set of listeners per binding in line with the settings until
    /// shutdown. Bindings that fail are retried on the next settings change.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut versions = self.store.subscribe();
        let mut listeners: HashMap<Binding, Vec<JoinHandle<()>>> = HashMap::new();

        loop {
            self.reconcile(&mut listeners, &shutdown_rx).await;

            tokio::select! {
                changed = versions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        for handle in listeners.into_values().flatten() {
            handle.abort();
        }
        Ok(())
    }

    async fn reconcile(
        self: &Arc<Self>,
        listeners: &mut HashMap<Binding, Vec<JoinHandle<()>>>,
        shutdown_rx: &watch::Receiver<bool>,
    ) {
        let wanted = compute_bindings(&self.store.snapshot());

        listeners.retain(|binding, handles| {
            if wanted.contains(binding) {
                return true;
            }
            info!(binding = ?binding, "Closing listener");
            for handle in handles.iter() {
                handle.abort();
            }
            false
        });

        for binding in wanted {
            if listeners.contains_key(&binding) {
                continue;
            }
            match bind(binding).await {
                Ok(bound) => {
                    let handles = bound
                        .into_iter()
                        .map(|listener| {
                            if let Ok(addr) = listener.local_addr() {
                                info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");
                            }
                            tokio::spawn(Arc::clone(self).serve_listener(listener, shutdown_rx.clone()))
                        })
                        .collect();
                    listeners.insert(binding, handles);
                }
                Err(e) => error!(binding = ?binding, error = %e, "Failed to bind listener"),
            }
        }
    }

    fn connection_semaphore(&self) -> Arc<Semaphore> {
        let max = self.store.snapshot().server_max_connection_count;
        let mut limit = self.limit.lock();
        if limit.max != max {
            debug!(max, "Connection limit changed");
            *limit = ConnectionLimit::new(max);
        }
        Arc::clone(&limit.semaphore)
    }

    /// Accept connections from one listener until shutdown
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let permit = tokio::select! {
                permit = self.connection_semaphore().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => continue,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let proxy = Arc::clone(&self);
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = proxy.handle_connection(stream, peer).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let _ = stream.set_nodelay(true);
        let peer = canonical(peer);
        let local = canonical(stream.local_addr()?);

        let (http, https) = {
            let settings = self.store.snapshot();
            (
                !routing::resolve_entrypoints(&settings, local, false).is_empty(),
                !routing::resolve_entrypoints(&settings, local, true).is_empty(),
            )
        };
        let secure = match (http, https) {
            (true, true) => looks_like_tls(&stream).await?,
            (false, true) => true,
            _ => false,
        };

        if secure {
            self.serve_tls(stream, ConnectionInfo { peer, local, secure })
                .await
        } else {
            self.serve_http(stream, ConnectionInfo { peer, local, secure })
                .await
        }
    }

    async fn serve_tls(self: Arc<Self>, stream: TcpStream, conn: ConnectionInfo) -> anyhow::Result<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for ClientHello"))??;

        let (server_name, acme_validation) = {
            let hello = start.client_hello();
            (
                hello.server_name().unwrap_or_default().to_ascii_lowercase(),
                tls::is_acme_tls_alpn(&hello),
            )
        };

        if acme_validation {
            let cert = self.certs.tls_alpn_certificate(&server_name);
            info!(
                peer = %conn.peer,
                server_name = %server_name,
                prepared = cert.is_some(),
                "ACME TLS-ALPN-01 validation"
            );
            let Some(cert) = cert else { return Ok(()) };
            let config = tls::acme_challenge_config(cert)?;
            // The validator only inspects the handshake.
            let _stream = start.into_stream(config).await?;
            return Ok(());
        }

        let Some((cert, cipher_suites)) = self.select_certificate(&server_name, conn).await else {
            return Ok(());
        };
        let config = tls::server_config(cipher_suites, cert)?;
        let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))??;

        self.serve_http(tls_stream, conn).await
    }

    /// Route a TLS connection by server name and find its certificate; `None`
    /// closes the connection
    async fn select_certificate(
        &self,
        server_name: &str,
        conn: ConnectionInfo,
    ) -> Option<(Arc<CertifiedKey>, TlsCipherSuiteSet)> {
        let settings = self.store.snapshot();
        let candidates = routing::resolve_entrypoints(&settings, conn.local, true);
        if candidates.is_empty() {
            warn!(peer = %conn.peer, local = %conn.local, "No entrypoint serves HTTPS on this endpoint");
            return None;
        }
        let route = routing::resolve_exitpoint(&settings, &candidates, server_name)?;
        if route.exitpoint.kind == ExitpointType::Disabled {
            return None;
        }
        let middlewares = settings.middlewares_for(route.entrypoint, route.exitpoint);
        if !middleware::peer_allowed(&middlewares, conn.peer.ip()) {
            debug!(peer = %conn.peer, server_name = %server_name, "Handshake rejected by IP whitelist");
            return None;
        }

        let cipher_suites = route.entrypoint.tls_cipher_suite_set;
        if route.exitpoint.auto_certificate {
            let domain = route.exitpoint.hostname_match(server_name).unwrap_or(server_name);
            match self
                .certs
                .get_certificate(domain, route.entrypoint, route.exitpoint, true)
                .await
            {
                Ok(Some(cert)) => return Some((cert, cipher_suites)),
                Ok(None) => debug!(domain = %domain, "No ACME certificate available yet, closing connection"),
                Err(e) => warn!(domain = %domain, error = %e, "ACME certificate unavailable, closing connection"),
            }
            return None;
        }

        match self.certs.static_certificate(route.exitpoint).await {
            Ok(Some(cert)) => Some((cert, cipher_suites)),
            Ok(None) => {
                warn!(exitpoint = %route.exitpoint.name, "No certificate available, closing connection");
                None
            }
            Err(e) => {
                error!(exitpoint = %route.exitpoint.name, error = %e, "Failed to load certificate");
                None
            }
        }
    }

    async fn serve_http<S>(self: Arc<Self>, stream: S, conn: ConnectionInfo) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&self);
            async move { proxy.handle_request(req, conn).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
    ) -> Result<Response<ProxyBody>, ConnectionDropped> {
        let started = Instant::now();
        let settings = self.store.snapshot();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let Some(host) = extract_hostname(&req) else {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        };

        let candidates = routing::resolve_entrypoints(&settings, conn.local, conn.secure);
        if candidates.is_empty() {
            error!(peer = %conn.peer, local = %conn.local, host = %host, "No entrypoint matches this endpoint");
            let mut response = json_error_response(ProxyErrorCode::NoEntrypoint, "No entrypoint is configured");
            if req.version() < Version::HTTP_2 {
                response
                    .headers_mut()
                    .insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
            }
            return Ok(response);
        }

        let Some(route) = routing::resolve_exitpoint(&settings, &candidates, &host) else {
            debug!(peer = %conn.peer, host = %host, "No exitpoint matches host, closing");
            return Err(ConnectionDropped);
        };
        if route.exitpoint.kind == ExitpointType::Disabled {
            return Err(ConnectionDropped);
        }

        if route.exitpoint.auto_certificate {
            if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
                return Ok(self.acme_challenge_response(&host, token, route));
            }
        }

        let ctx = RequestContext {
            peer: conn.peer,
            local: conn.local,
            secure: conn.secure,
            host,
        };

        let outcome = middleware::run(&settings, route, &ctx, &req, &self.digest);
        let mut response = match outcome {
            PipelineOutcome::Redirect(location) => redirect_response(&location),
            PipelineOutcome::Drop => {
                debug!(peer = %conn.peer, host = %ctx.host, "Request dropped by IP whitelist");
                return Err(ConnectionDropped);
            }
            PipelineOutcome::Unauthorized(challenge) => unauthorized_response(&challenge),
            PipelineOutcome::Continue(plan) => {
                let mut response = match route.exitpoint.kind {
                    ExitpointType::AdminConsole => self.admin.handle(req, plan.user.as_deref()).await,
                    _ => self.forward(req, route.exitpoint, &ctx, &plan).await,
                };
                middleware::apply_header_edits(response.headers_mut(), &plan.response_headers, &ctx);
                response
            }
        };

        if settings.verbose_web_server_logs {
            info!(
                peer = %conn.peer,
                host = %ctx.host,
                %method,
                %path,
                exitpoint = %route.exitpoint.name,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request handled"
            );
        } else {
            debug!(host = %ctx.host, %method, %path, status = response.status().as_u16(), "Request handled");
        }

        Ok(response)
    }

    fn acme_challenge_response(&self, host: &str, token: &str, route: Route<'_>) -> Response<ProxyBody> {
        match self
            .certs
            .http_challenge_response(host, token, route.entrypoint, route.exitpoint)
        {
            Some(key_authorization) => {
                debug!(host, token, "Responding to ACME HTTP-01 challenge");
                Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                    .body(full_body(key_authorization))
                    .expect("valid response builder")
            }
            None => {
                debug!(host, token, "Unknown ACME HTTP-01 token");
                json_error_response(ProxyErrorCode::NotFound, "Unknown challenge token")
            }
        }
    }

    /// Send a request to the exitpoint's origin and relay the answer
    async fn forward(
        &self,
        req: Request<Incoming>,
        exitpoint: &Exitpoint,
        ctx: &RequestContext,
        plan: &DispatchPlan,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        let origin = match exitpoint.destination_origin.parse::<Uri>() {
            Ok(uri) if uri.scheme().is_some() && uri.authority().is_some() => uri,
            _ => {
                error!(exitpoint = %exitpoint.name, "Exitpoint has an unusable destination origin");
                return json_error_response(ProxyErrorCode::UpstreamConfigError, "Upstream is misconfigured");
            }
        };
        let client = match self.pool.client_for(exitpoint) {
            Ok(client) => client,
            Err(e) => {
                error!(exitpoint = %exitpoint.name, error = %e, "No upstream client");
                return json_error_response(ProxyErrorCode::InternalError, "Upstream client unavailable");
            }
        };

        let (parts, body) = req.into_parts();
        let original_host = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| ctx.host.clone());
        let url = upstream_url(&origin, &parts.uri);

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(hyper::header::HOST);
        plan.forwarded.apply(&mut headers, ctx, &original_host);
        let upstream_host = if exitpoint.destination_host_header.is_empty() {
            origin.authority().map(|a| a.as_str().to_string()).unwrap_or_default()
        } else {
            exitpoint.destination_host_header.clone()
        };
        if let Ok(value) = HeaderValue::from_str(&upstream_host) {
            headers.insert(hyper::header::HOST, value);
        }
        middleware::apply_header_edits(&mut headers, &plan.request_headers, ctx);
        if !plan.body_rewrites.is_empty() {
            headers.remove(hyper::header::ACCEPT_ENCODING);
        }

        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return json_error_response(ProxyErrorCode::BadRequest, "Unsupported method");
        };
        let mut request = client.request(method, url.as_str()).headers(to_reqwest_headers(&headers));
        if !body.is_end_stream() {
            let stream = BodyStream::new(body).try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())));
            request = request.body(reqwest::Body::wrap_stream(stream));
        }

        let network_timeout = Duration::from_secs(u64::from(exitpoint.network_timeout_sec.max(1)));
        let stats = self.pool.stats();
        stats.record_request();

        let upstream = match tokio::time::timeout(network_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                stats.record_failure();
                warn!(exitpoint = %exitpoint.name, url = %url, "Upstream request timed out");
                return json_error_response(ProxyErrorCode::RequestTimeout, "Upstream timed out");
            }
            Ok(Err(e)) => {
                stats.record_failure();
                // Log detailed error internally, return generic message externally
                error!(exitpoint = %exitpoint.name, url = %url, error = %e, "Failed to forward request");
                return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to upstream");
            }
            Err(_) => {
                stats.record_failure();
                warn!(
                    exitpoint = %exitpoint.name,
                    url = %url,
                    timeout_secs = network_timeout.as_secs(),
                    "Upstream request timed out"
                );
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", network_timeout.as_secs()),
                );
            }
        };
        let headers_received = started.elapsed();

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = from_reqwest_headers(upstream.headers());
        strip_hop_by_hop(&mut response_headers);
        if !plan.body_rewrites.is_empty() {
            rewrite_location_header(&mut response_headers, plan);
        }

        let rewrite = !plan.body_rewrites.is_empty()
            && parts.method != Method::HEAD
            && middleware::is_rewritable_content(&response_headers);

        let body = if rewrite {
            let remaining = network_timeout.saturating_sub(started.elapsed());
            let bytes = match tokio::time::timeout(remaining, upstream.bytes()).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    error!(exitpoint = %exitpoint.name, error = %e, "Failed to read upstream body");
                    return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to read upstream response");
                }
                Err(_) => {
                    return json_error_response(ProxyErrorCode::RequestTimeout, "Upstream timed out");
                }
            };
            let rewritten = middleware::rewrite_body(&String::from_utf8_lossy(&bytes), &plan.body_rewrites);
            response_headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
            full_body(rewritten)
        } else {
            let stream = upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError);
            StreamBody::new(stream).boxed_unsync()
        };

        if plan.server_timing {
            let value = server_timing(headers_received, rewrite.then(|| started.elapsed()));
            if let Ok(value) = HeaderValue::from_str(&value) {
                response_headers.append(HeaderName::from_static("server-timing"), value);
            }
        }

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

async fn looks_like_tls(stream: &TcpStream) -> anyhow::Result<bool> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.peek(&mut first))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for first byte"))??;
    Ok(n == 1 && first[0] == TLS_HANDSHAKE_RECORD)
}

/// Requested hostname from the Host header or, for HTTP/2, the URI authority.
/// Lowercased, without port or IPv6 brackets.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let authority = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;
    let authority: hyper::http::uri::Authority = authority.parse().ok()?;
    let hostname = authority.host().trim_start_matches('[').trim_end_matches(']');

    // Validate length (DNS max is 253 characters)
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Hostnames and IP literals only; this keeps the value safe to log
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// The origin's scheme and authority with the request's path and query
fn upstream_url(origin: &Uri, request: &Uri) -> String {
    let scheme = origin.scheme_str().unwrap_or("http");
    let authority = origin.authority().map(|a| a.as_str()).unwrap_or_default();
    let path = request.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, authority, path)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

fn rewrite_location_header(headers: &mut HeaderMap, plan: &DispatchPlan) {
    let Some(location) = headers
        .get(hyper::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return;
    };
    let rewritten = middleware::rewrite_location(&location, &plan.body_rewrites);
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(hyper::header::LOCATION, value);
    }
}

fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            out.append(name, value);
        }
    }
    out
}

fn from_reqwest_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_str().as_bytes());
        let value = HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            out.append(name, value);
        }
    }
    out
}

fn server_timing(headers_received: Duration, body_read: Option<Duration>) -> String {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let mut value = format!("proxy-upstream;desc=\"Upstream response headers\";dur={:.1}", ms(headers_received));
    if let Some(read) = body_read {
        value.push_str(&format!(", proxy-read;desc=\"Upstream body read and rewrite\";dur={:.1}", ms(read)));
    }
    value
}

/// Build a redirect response (302 Found)
fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, value)
            .body(full_body(Bytes::new()))
            .expect("valid redirect response"),
        Err(_) => json_error_response(ProxyErrorCode::BadRequest, "Invalid redirect target"),
    }
}

fn unauthorized_response(challenge: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(challenge) {
        Ok(value) => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(hyper::header::WWW_AUTHENTICATE, value)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body("401 Unauthorized"))
            .expect("valid unauthorized response"),
        Err(_) => json_error_response(ProxyErrorCode::InternalError, "Invalid authentication challenge"),
    }
}

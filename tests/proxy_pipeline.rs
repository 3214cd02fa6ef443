//! End-to-end tests: a proxy listener in front of a local backend

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use md5::{Digest, Md5};
use routegate::acme::{AcmeTiming, CertManager};
use routegate::proxy::ProxyServer;
use routegate::renewal::{ManualClock, RenewalDates};
use routegate::settings::{
    Entrypoint, Exitpoint, ExitpointType, Middleware, MiddlewareType, ProxyHeaderBehavior, ProxyRoute, Settings,
};
use routegate::store::SettingsStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Backend that describes what it received
async fn backend_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };

    if req.uri().path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    if req.uri().path() == "/redirect" {
        let location = format!("http://{}/login", header("host"));
        return Ok(Response::builder()
            .status(302)
            .header("location", location)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    let body = format!(
        "host={};xff={};path={};link=<a href=\"http://{}/x\">",
        header("host"),
        header("x-forwarded-for"),
        req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"),
        header("host"),
    );
    Ok(Response::builder()
        .header("content-type", "text/html; charset=utf-8")
        .header("x-backend", "1")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

async fn start_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(backend_handler))
                    .await;
            });
        }
    });
    addr
}

struct TestProxy {
    port: u16,
    store: Arc<SettingsStore>,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Serve `settings` on a fresh local port. `configure` receives the port so
/// entrypoints can point at it.
async fn start_proxy(configure: impl FnOnce(u16) -> Settings) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();

    let store = Arc::new(SettingsStore::in_memory_at(configure(port), dir.path().join("settings.json")));
    let dates = RenewalDates::load(
        dir.path().join("cert_renewal_dates.json"),
        Arc::new(ManualClock::at(1_700_000_000_000)),
    );
    let certs = CertManager::with_parts(
        store.clone(),
        dir.path().join("certs"),
        "http://127.0.0.1:9/directory".to_string(),
        dates,
        AcmeTiming::default(),
    );
    let proxy = ProxyServer::new(store.clone(), certs);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(proxy.serve_listener(listener, shutdown_rx));

    TestProxy {
        port,
        store,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

fn app_settings(port: u16, backend: SocketAddr, middlewares: Vec<Middleware>) -> Settings {
    let mut s = Settings::default();
    let mut ep = Entrypoint::new("Public");
    ep.http_port = port;
    ep.https_port = 8443;
    s.entrypoints.push(ep);

    let mut exit = Exitpoint::new("App", "app.test, *.app.test", ExitpointType::WebProxy);
    exit.destination_origin = format!("http://{}", backend);
    exit.network_timeout_sec = 1;
    exit.middlewares = middlewares.iter().map(|m| m.id.clone()).collect();
    s.exitpoints.push(exit);
    s.middlewares = middlewares;
    s.proxy_routes.push(ProxyRoute::new("Public", "App"));
    s
}

/// Send a raw HTTP/1.1 request and read until the server closes.
/// An empty string means the connection was closed without a response.
async fn send(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

async fn get(port: u16, host: &str, path: &str) -> String {
    send(
        port,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host),
    )
    .await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[tokio::test]
async fn test_proxies_to_origin_with_origin_host() {
    let backend = start_backend().await;
    let mut xff = Middleware::new("Xff", MiddlewareType::XForwardedFor);
    xff.proxy_header_behavior = ProxyHeaderBehavior::Create;
    let proxy = start_proxy(|port| app_settings(port, backend, vec![xff])).await;

    let response = get(proxy.port, "App.Test", "/hello?x=1").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(header_of(&response, "x-backend"), Some("1"));
    let body = body_of(&response);
    assert!(body.contains(&format!("host={}", backend)), "{}", body);
    assert!(body.contains("xff=127.0.0.1"), "{}", body);
    assert!(body.contains("path=/hello?x=1"), "{}", body);
}

#[tokio::test]
async fn test_wildcard_host_and_host_header_override() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.exitpoints[0].destination_host_header = "internal.example".to_string();
        s
    })
    .await;

    let response = get(proxy.port, "api.app.test", "/").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(body_of(&response).contains("host=internal.example"));
}

#[tokio::test]
async fn test_unknown_host_closes_connection() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| app_settings(port, backend, vec![])).await;

    assert_eq!(get(proxy.port, "other.test", "/").await, "");
}

#[tokio::test]
async fn test_disabled_exitpoint_closes_connection() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.exitpoints[0].kind = ExitpointType::Disabled;
        s
    })
    .await;

    assert_eq!(get(proxy.port, "app.test", "/").await, "");
}

#[tokio::test]
async fn test_missing_host_header() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| app_settings(port, backend, vec![])).await;

    let response = send(proxy.port, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(status_of(&response), 400);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("MISSING_HOST_HEADER"));
}

#[tokio::test]
async fn test_endpoint_without_entrypoint_answers_500() {
    let backend = start_backend().await;
    // The entrypoint points at some other port than the one being served.
    let proxy = start_proxy(|port| app_settings(port.wrapping_add(1).max(1), backend, vec![])).await;

    let response = get(proxy.port, "app.test", "/").await;
    assert_eq!(status_of(&response), 500);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("NO_ENTRYPOINT"));
}

#[tokio::test]
async fn test_redirect_to_https() {
    let backend = start_backend().await;
    let redirect = Middleware::new("Tls", MiddlewareType::RedirectHttpToHttps);
    let proxy = start_proxy(|port| app_settings(port, backend, vec![redirect])).await;

    let response = get(proxy.port, "app.test", "/a/b?c=1").await;
    assert_eq!(status_of(&response), 302);
    assert_eq!(header_of(&response, "location"), Some("https://app.test:8443/a/b?c=1"));
}

#[tokio::test]
async fn test_whitelist_drops_before_digest_challenge() {
    let backend = start_backend().await;
    let mut whitelist = Middleware::new("Office", MiddlewareType::IpWhitelist);
    whitelist.whitelisted_ip_ranges = vec!["10.0.0.0/8".to_string()];
    let mut login = Middleware::new("Login", MiddlewareType::HttpDigestAuth);
    login.set_password("admin", "secret");
    let proxy = start_proxy(|port| app_settings(port, backend, vec![whitelist, login])).await;

    assert_eq!(get(proxy.port, "app.test", "/").await, "");

    // Once loopback is admitted the login applies.
    proxy
        .store
        .update(|s| s.middlewares[0].whitelisted_ip_ranges.push("127.0.0.1".to_string()))
        .unwrap();
    let response = get(proxy.port, "app.test", "/").await;
    assert_eq!(status_of(&response), 401);
    let challenge = header_of(&response, "www-authenticate").unwrap();
    assert!(challenge.starts_with("Digest "));
    assert!(challenge.contains("realm=\"app.test\""));
}

#[tokio::test]
async fn test_header_edits_and_server_timing() {
    let backend = start_backend().await;
    let mut add = Middleware::new("Add", MiddlewareType::AddHttpHeaderToResponse);
    add.http_headers = vec!["X-Served-By: $server_name".to_string()];
    let mut remove = Middleware::new("Remove", MiddlewareType::RemoveHttpHeaderFromResponse);
    remove.http_headers = vec!["X-Backend".to_string()];
    let timing = Middleware::new("Timing", MiddlewareType::AddProxyServerTiming);
    let proxy = start_proxy(|port| app_settings(port, backend, vec![add, remove, timing])).await;

    let response = get(proxy.port, "app.test", "/").await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(header_of(&response, "x-served-by"), Some("app.test"));
    assert_eq!(header_of(&response, "x-backend"), None);
    assert!(header_of(&response, "server-timing").unwrap().contains("proxy-upstream"));
}

#[tokio::test]
async fn test_hostname_substitution_rewrites_body_and_location() {
    let backend = start_backend().await;
    let substitution = Middleware::new("Sub", MiddlewareType::HostnameSubstitution);
    let proxy = start_proxy(|port| app_settings(port, backend, vec![substitution])).await;

    let response = get(proxy.port, "app.test", "/page").await;
    assert_eq!(status_of(&response), 200);
    let body = body_of(&response);
    let expected_link = format!("http://app.test:{}/x", backend.port());
    assert!(body.contains(&expected_link), "{}", body);
    assert_eq!(
        header_of(&response, "content-length").and_then(|v| v.parse::<usize>().ok()),
        Some(body.len())
    );

    let response = get(proxy.port, "app.test", "/redirect").await;
    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_of(&response, "location"),
        Some(format!("http://app.test:{}/login", backend.port()).as_str())
    );
}

#[tokio::test]
async fn test_upstream_failures() {
    // Nothing listens on the discard port.
    let dead: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let proxy = start_proxy(|port| app_settings(port, dead, vec![])).await;
    let response = get(proxy.port, "app.test", "/").await;
    assert_eq!(status_of(&response), 502);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("CONNECTION_FAILED"));

    let backend = start_backend().await;
    let proxy = start_proxy(|port| app_settings(port, backend, vec![])).await;
    let response = get(proxy.port, "app.test", "/slow").await;
    assert_eq!(status_of(&response), 504);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("REQUEST_TIMEOUT"));
}

#[tokio::test]
async fn test_acme_challenge_path_is_not_proxied() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.acme_account_email = "ops@app.test".to_string();
        s.exitpoints[0].auto_certificate = true;
        s
    })
    .await;

    let response = get(proxy.port, "app.test", "/.well-known/acme-challenge/unknown-token").await;
    assert_eq!(status_of(&response), 404);
    assert!(header_of(&response, "x-backend").is_none());
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn param<'a>(challenge: &'a str, name: &str) -> &'a str {
    let start = challenge.find(&format!("{}=\"", name)).unwrap() + name.len() + 2;
    let end = challenge[start..].find('"').unwrap() + start;
    &challenge[start..end]
}

#[tokio::test]
async fn test_admin_console_behind_digest_login() {
    let proxy = start_proxy(|port| {
        let mut s = Settings::default();
        s.ensure_admin_console();
        s.entrypoints.iter_mut().for_each(|e| {
            e.http_port = port;
            e.https_port = 0;
        });
        s.middlewares[0].set_password("admin", "hunter2");
        s
    })
    .await;

    let response = get(proxy.port, "localhost", "/api/status").await;
    assert_eq!(status_of(&response), 401);
    let challenge = header_of(&response, "www-authenticate").unwrap().to_string();
    let nonce = param(&challenge, "nonce");

    let ha1 = md5_hex("admin:localhost:hunter2");
    let ha2 = md5_hex("GET:/api/status");
    let digest = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));
    let authorization = format!(
        "Digest username=\"admin\", realm=\"localhost\", nonce=\"{}\", uri=\"/api/status\", response=\"{}\"",
        nonce, digest
    );
    let response = send(
        proxy.port,
        &format!(
            "GET /api/status HTTP/1.1\r\nHost: localhost\r\nAuthorization: {}\r\nConnection: close\r\n\r\n",
            authorization
        ),
    )
    .await;
    assert_eq!(status_of(&response), 200, "{}", response);
    let status: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(status["success"], true);
    assert_eq!(status["exitpoints"], 1);
}

fn tls_client(port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("app.test", SocketAddr::from(([127, 0, 0, 1], port)))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_tls_and_plain_http_share_a_port() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.entrypoints[0].https_port = port;
        s
    })
    .await;
    let client = tls_client(proxy.port);

    let response = client
        .get(format!("https://app.test:{}/secure", proxy.port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.unwrap().contains("path=/secure"));

    let response = client
        .get(format!("http://app.test:{}/plain", proxy.port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The generated certificate's location was saved back into the settings.
    let saved = proxy.store.snapshot();
    assert!(saved.exitpoints[0].certificate_path.ends_with(".pem"));
}

#[tokio::test]
async fn test_tls_closed_without_certificate() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.entrypoints[0].http_port = 0;
        s.entrypoints[0].https_port = port;
        s.exitpoints[0].allow_generate_self_signed_certificate = false;
        s
    })
    .await;

    let result = tls_client(proxy.port)
        .get(format!("https://app.test:{}/", proxy.port))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_tls_closed_when_auto_certificate_unavailable() {
    let backend = start_backend().await;
    let proxy = start_proxy(|port| {
        let mut s = app_settings(port, backend, vec![]);
        s.acme_account_email = "ops@app.test".to_string();
        s.entrypoints[0].https_port = port;
        s.exitpoints[0].auto_certificate = true;
        s
    })
    .await;

    let result = tls_client(proxy.port)
        .get(format!("https://app.test:{}/", proxy.port))
        .send()
        .await;
    assert!(result.is_err());

    // No self-signed certificate was generated in place of the ACME one.
    let saved = proxy.store.snapshot();
    assert!(saved.exitpoints[0].certificate_path.is_empty());
}

//! Proxy settings: entrypoints, exitpoints, middlewares and proxy routes
//!
//! [`Settings`] is the persisted configuration graph. Live readers only ever
//! see it behind an `Arc` published by the settings store, so the validation
//! and repair routines here, which take `&mut self`, can only run on a
//! detached copy.

use crate::error::SettingsError;
use crate::hostmatch::{self, MatchKind};
use crate::iprange::IpRangeSet;
use crate::middleware::{parse_header_line, parse_header_name};
use hyper::Uri;
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const ADMIN_CONSOLE_LOGIN_ID: &str = "Admin Console Login";
pub const ADMIN_CONSOLE_EXITPOINT_NAME: &str = "Admin Console";
pub const ADMIN_CONSOLE_ENTRYPOINT_NAME: &str = "Admin Console Entrypoint";
pub const ADMIN_CONSOLE_USER: &str = "admin";
pub const ADMIN_CONSOLE_PORT: u16 = 8080;

const MIN_CONNECTION_COUNT: u32 = 8;
const MAX_CONNECTION_COUNT: u32 = 10_000;

/// TLS cipher suite selection for an entrypoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsCipherSuiteSet {
    /// Everything the TLS provider enables by default
    #[default]
    Default,
    /// TLS 1.3 plus 256-bit and ChaCha20 ECDHE suites for TLS 1.2
    Modern,
    /// TLS 1.3 only
    Strict,
}

/// A logical listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entrypoint {
    pub name: String,
    /// Interface address; empty listens on every interface
    #[serde(default)]
    pub ip_address: String,
    /// Plain HTTP port, 0 when disabled
    #[serde(default)]
    pub http_port: u16,
    /// HTTPS port, 0 when disabled
    #[serde(default)]
    pub https_port: u16,
    #[serde(default)]
    pub tls_cipher_suite_set: TlsCipherSuiteSet,
    #[serde(default)]
    pub middlewares: Vec<String>,
}

impl Entrypoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_address: String::new(),
            http_port: 0,
            https_port: 0,
            tls_cipher_suite_set: TlsCipherSuiteSet::Default,
            middlewares: Vec::new(),
        }
    }

    pub fn http_enabled(&self) -> bool {
        self.http_port != 0
    }

    pub fn https_enabled(&self) -> bool {
        self.https_port != 0
    }

    /// The port serving the given protocol, if enabled
    pub fn port_for(&self, secure: bool) -> Option<u16> {
        let port = if secure { self.https_port } else { self.http_port };
        (port != 0).then_some(port)
    }

    /// Whether the entrypoint listens on a port an ACME server can reach for
    /// HTTP-01 or TLS-ALPN-01 validation
    pub fn serves_standard_ports(&self) -> bool {
        self.http_port == 80 || self.https_port == 443
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitpointType {
    #[default]
    Disabled,
    AdminConsole,
    WebProxy,
}

/// A logical destination selected by hostname
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exitpoint {
    pub name: String,
    /// One or more comma/space separated host templates
    #[serde(default)]
    pub host: String,
    #[serde(default, rename = "type")]
    pub kind: ExitpointType,
    #[serde(default)]
    pub destination_origin: String,
    /// Host header sent upstream instead of the origin's authority
    #[serde(default)]
    pub destination_host_header: String,
    #[serde(default)]
    pub proxy_accept_any_certificate: bool,
    #[serde(default = "default_true")]
    pub use_connection_keep_alive: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u32,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_sec: u32,
    #[serde(default)]
    pub auto_certificate: bool,
    #[serde(default)]
    pub certificate_path: String,
    #[serde(default = "default_true")]
    pub allow_generate_self_signed_certificate: bool,
    /// Prefer DNS-01 validation through the DNS provider API
    #[serde(default)]
    pub cloudflare_dns_validation: bool,
    #[serde(default)]
    pub middlewares: Vec<String>,
}

impl Exitpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, kind: ExitpointType) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            kind,
            destination_origin: String::new(),
            destination_host_header: String::new(),
            proxy_accept_any_certificate: false,
            use_connection_keep_alive: true,
            connect_timeout_sec: default_connect_timeout(),
            network_timeout_sec: default_network_timeout(),
            auto_certificate: false,
            certificate_path: String::new(),
            allow_generate_self_signed_certificate: true,
            cloudflare_dns_validation: false,
            middlewares: Vec::new(),
        }
    }

    /// Every host template in the `host` field
    pub fn all_domains(&self) -> Vec<&str> {
        hostmatch::host_templates(&self.host).collect()
    }

    pub fn host_match(&self, requested: &str) -> Option<MatchKind> {
        hostmatch::match_host(requested, &self.host)
    }

    /// The template that matched the requested host, preferring exact matches
    pub fn hostname_match(&self, requested: &str) -> Option<&str> {
        hostmatch::match_hostname_best(requested, &self.all_domains()).map(|(t, _)| t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MiddlewareType {
    IpWhitelist,
    HttpDigestAuth,
    RedirectHttpToHttps,
    AddHttpHeaderToRequest,
    AddHttpHeaderToResponse,
    RemoveHttpHeaderFromRequest,
    RemoveHttpHeaderFromResponse,
    AddProxyServerTiming,
    XForwardedFor,
    XForwardedHost,
    XForwardedProto,
    XRealIp,
    TrustedProxyIpRanges,
    HostnameSubstitution,
    RegexReplaceInResponse,
}

impl MiddlewareType {
    /// Types of which at most one may apply to any proxy route
    pub fn is_singleton(self) -> bool {
        matches!(
            self,
            MiddlewareType::RedirectHttpToHttps
                | MiddlewareType::AddProxyServerTiming
                | MiddlewareType::XForwardedFor
                | MiddlewareType::XForwardedHost
                | MiddlewareType::XForwardedProto
                | MiddlewareType::XRealIp
        )
    }
}

/// What to do with a client-supplied forwarding header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyHeaderBehavior {
    /// Remove the header before proxying
    #[default]
    Drop,
    /// Replace the header with the value observed by this proxy
    Create,
    /// Forward the client's header if the peer is trusted, otherwise drop it
    PassthroughIfTrusted,
    /// Append to the client's header if the peer is trusted, otherwise create
    CombineIfTrustedElseCreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub pass: String,
}

/// A typed behavior attached to entrypoints and exitpoints by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MiddlewareType,
    #[serde(default)]
    pub whitelisted_ip_ranges: Vec<String>,
    #[serde(default)]
    pub auth_credentials: Vec<Credential>,
    /// `Name: value` lines, or bare names for the removal types
    #[serde(default)]
    pub http_headers: Vec<String>,
    #[serde(default)]
    pub proxy_header_behavior: ProxyHeaderBehavior,
    #[serde(default)]
    pub regex_pattern: String,
    #[serde(default)]
    pub regex_replacement: String,
}

impl Middleware {
    pub fn new(id: impl Into<String>, kind: MiddlewareType) -> Self {
        Self {
            id: id.into(),
            kind,
            whitelisted_ip_ranges: Vec::new(),
            auth_credentials: Vec::new(),
            http_headers: Vec::new(),
            proxy_header_behavior: ProxyHeaderBehavior::Drop,
            regex_pattern: String::new(),
            regex_replacement: String::new(),
        }
    }

    pub fn set_password(&mut self, user: &str, pass: &str) {
        match self.auth_credentials.iter_mut().find(|c| c.user == user) {
            Some(c) => c.pass = pass.to_string(),
            None => self.auth_credentials.push(Credential {
                user: user.to_string(),
                pass: pass.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRoute {
    pub entrypoint_name: String,
    pub exitpoint_name: String,
}

impl ProxyRoute {
    pub fn new(entrypoint: impl Into<String>, exitpoint: impl Into<String>) -> Self {
        Self {
            entrypoint_name: entrypoint.into(),
            exitpoint_name: exitpoint.into(),
        }
    }
}

/// The complete persisted configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub entrypoints: Vec<Entrypoint>,
    #[serde(default)]
    pub exitpoints: Vec<Exitpoint>,
    #[serde(default)]
    pub middlewares: Vec<Middleware>,
    #[serde(default)]
    pub proxy_routes: Vec<ProxyRoute>,
    #[serde(default)]
    pub acme_account_email: String,
    /// Serialized ACME account credentials
    #[serde(default)]
    pub acme_account_key: Option<serde_json::Value>,
    /// The email the stored account was registered with
    #[serde(default)]
    pub acme_account_key_email: String,
    #[serde(default)]
    pub cloudflare_api_token: String,
    #[serde(default)]
    pub verbose_web_server_logs: bool,
    #[serde(default = "default_max_connections")]
    pub server_max_connection_count: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            entrypoints: Vec::new(),
            exitpoints: Vec::new(),
            middlewares: Vec::new(),
            proxy_routes: Vec::new(),
            acme_account_email: String::new(),
            acme_account_key: None,
            acme_account_key_email: String::new(),
            cloudflare_api_token: String::new(),
            verbose_web_server_logs: false,
            server_max_connection_count: default_max_connections(),
        }
    }
}

/// Result of [`Settings::ensure_admin_console`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdminConsoleRepair {
    pub changed: bool,
    /// Password generated for a freshly created admin login
    pub generated_password: Option<String>,
}

impl Settings {
    /// Names are unique ignoring ASCII case, and lookups match the same way
    pub fn find_entrypoint(&self, name: &str) -> Option<&Entrypoint> {
        self.entrypoints.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn find_exitpoint(&self, name: &str) -> Option<&Exitpoint> {
        self.exitpoints.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn find_middleware(&self, id: &str) -> Option<&Middleware> {
        self.middlewares.iter().find(|m| m.id == id)
    }

    /// Exitpoints reachable from an entrypoint, in route order
    pub fn routed_exitpoints<'a>(&'a self, entrypoint: &'a str) -> impl Iterator<Item = &'a Exitpoint> {
        self.proxy_routes
            .iter()
            .filter(move |r| r.entrypoint_name.eq_ignore_ascii_case(entrypoint))
            .filter_map(move |r| self.find_exitpoint(&r.exitpoint_name))
    }

    /// Entrypoints routed to an exitpoint, in route order
    pub fn routed_entrypoints<'a>(&'a self, exitpoint: &'a str) -> impl Iterator<Item = &'a Entrypoint> {
        self.proxy_routes
            .iter()
            .filter(move |r| r.exitpoint_name.eq_ignore_ascii_case(exitpoint))
            .filter_map(move |r| self.find_entrypoint(&r.entrypoint_name))
    }

    /// Middlewares attached to either end of a route, in settings order
    pub fn middlewares_for(&self, entrypoint: &Entrypoint, exitpoint: &Exitpoint) -> Vec<&Middleware> {
        self.middlewares
            .iter()
            .filter(|m| entrypoint.middlewares.contains(&m.id) || exitpoint.middlewares.contains(&m.id))
            .collect()
    }

    /// Normalize and validate the whole graph.
    ///
    /// Names and middleware references are trimmed, timeouts and the
    /// connection limit are clamped. Anything that cannot be repaired is
    /// reported with the offending object's name.
    pub fn validate(&mut self) -> Result<(), SettingsError> {
        self.acme_account_email = self.acme_account_email.trim().to_string();
        self.cloudflare_api_token = self.cloudflare_api_token.trim().to_string();
        self.server_max_connection_count = self
            .server_max_connection_count
            .clamp(MIN_CONNECTION_COUNT, MAX_CONNECTION_COUNT);

        let mut names = HashSet::new();
        for (index, entrypoint) in self.entrypoints.iter_mut().enumerate() {
            entrypoint.name = entrypoint.name.trim().to_string();
            if entrypoint.name.is_empty() {
                return Err(invalid(format!("Entrypoint index {} does not have a name.", index)));
            }
            if !names.insert(entrypoint.name.to_lowercase()) {
                return Err(invalid(format!(
                    "Entrypoint names are not unique. Duplicate name: \"{}\"",
                    entrypoint.name
                )));
            }
            trim_all(&mut entrypoint.middlewares);
            entrypoint.ip_address = entrypoint.ip_address.trim().to_string();
            if !entrypoint.ip_address.is_empty()
                && entrypoint.ip_address.parse::<std::net::IpAddr>().is_err()
            {
                return Err(invalid(format!(
                    "Entrypoint \"{}\" has invalid IP Address \"{}\".",
                    entrypoint.name, entrypoint.ip_address
                )));
            }
        }

        names.clear();
        for (index, exitpoint) in self.exitpoints.iter_mut().enumerate() {
            exitpoint.name = exitpoint.name.trim().to_string();
            if exitpoint.name.is_empty() {
                return Err(invalid(format!("Exitpoint index {} does not have a name.", index)));
            }
            if !names.insert(exitpoint.name.to_lowercase()) {
                return Err(invalid(format!(
                    "Exitpoint names are not unique. Duplicate name: \"{}\"",
                    exitpoint.name
                )));
            }
            trim_all(&mut exitpoint.middlewares);
            exitpoint.certificate_path = exitpoint.certificate_path.trim().to_string();
            exitpoint.connect_timeout_sec = exitpoint.connect_timeout_sec.clamp(1, 60);
            exitpoint.network_timeout_sec = exitpoint.network_timeout_sec.clamp(1, 600);

            if exitpoint.kind != ExitpointType::Disabled
                && exitpoint.auto_certificate
                && self.acme_account_email.is_empty()
            {
                return Err(invalid(format!(
                    "Exitpoint \"{}\" is not allowed to use automatic certificate management because the ACME account email is not configured.",
                    exitpoint.name
                )));
            }

            if exitpoint.kind == ExitpointType::WebProxy {
                exitpoint.destination_origin = exitpoint.destination_origin.trim().to_string();
                if !is_absolute_http_uri(&exitpoint.destination_origin) {
                    return Err(invalid(format!(
                        "Exitpoint \"{}\" has invalid Destination Origin.",
                        exitpoint.name
                    )));
                }
                let host_header = exitpoint.destination_host_header.trim();
                if !host_header.is_empty()
                    && format!("http://{}:80/", host_header).parse::<Uri>().is_err()
                {
                    return Err(invalid(format!(
                        "Exitpoint \"{}\" has invalid Destination Host Header.",
                        exitpoint.name
                    )));
                }
                exitpoint.destination_host_header = host_header.to_string();
            }
        }

        names.clear();
        for (index, middleware) in self.middlewares.iter_mut().enumerate() {
            middleware.id = middleware.id.trim().to_string();
            if middleware.id.is_empty() {
                return Err(invalid(format!("Middleware index {} does not have a name.", index)));
            }
            if !names.insert(middleware.id.to_lowercase()) {
                return Err(invalid(format!(
                    "Middleware names are not unique. Duplicate name: \"{}\"",
                    middleware.id
                )));
            }
            validate_middleware_payload(middleware)?;
        }

        let known: HashSet<&str> = self.middlewares.iter().map(|m| m.id.as_str()).collect();
        let references = self
            .entrypoints
            .iter()
            .map(|e| ("Entrypoint", &e.name, &e.middlewares))
            .chain(self.exitpoints.iter().map(|e| ("Exitpoint", &e.name, &e.middlewares)));
        for (what, name, ids) in references {
            if let Some(missing) = ids.iter().find(|id| !known.contains(id.as_str())) {
                return Err(invalid(format!(
                    "{} \"{}\" references non-existent Middleware \"{}\".",
                    what, name, missing
                )));
            }
        }

        names.clear();
        for (index, route) in self.proxy_routes.iter_mut().enumerate() {
            route.entrypoint_name = route.entrypoint_name.trim().to_string();
            route.exitpoint_name = route.exitpoint_name.trim().to_string();
            if route.entrypoint_name.is_empty() {
                return Err(invalid(format!("ProxyRoute index {} does not specify an Entrypoint.", index)));
            }
            if route.exitpoint_name.is_empty() {
                return Err(invalid(format!("ProxyRoute index {} does not specify an Exitpoint.", index)));
            }
            let id = format!("[{}] -> [{}]", route.entrypoint_name, route.exitpoint_name);
            if !names.insert(id.to_lowercase()) {
                return Err(invalid(format!("ProxyRoutes are not unique. Duplicate ProxyRoutes: \"{}\"", id)));
            }
        }

        for (index, route) in self.proxy_routes.iter().enumerate() {
            let entrypoint = self.find_entrypoint(&route.entrypoint_name).ok_or_else(|| {
                invalid(format!(
                    "ProxyRoute index {} specifies non-existent Entrypoint named \"{}\".",
                    index, route.entrypoint_name
                ))
            })?;
            let exitpoint = self.find_exitpoint(&route.exitpoint_name).ok_or_else(|| {
                invalid(format!(
                    "ProxyRoute index {} specifies non-existent Exitpoint named \"{}\".",
                    index, route.exitpoint_name
                ))
            })?;

            let mut seen = HashSet::new();
            for m in self.middlewares_for(entrypoint, exitpoint) {
                if m.kind.is_singleton() && !seen.insert(m.kind) {
                    return Err(invalid(format!(
                        "ProxyRoute [{}] -> [{}] has more than one {:?} middleware.",
                        route.entrypoint_name, route.exitpoint_name, m.kind
                    )));
                }
            }
        }

        Ok(())
    }

    /// Create or repair the built-in admin console login, exitpoint,
    /// entrypoint and route. Running it twice makes no further changes.
    pub fn ensure_admin_console(&mut self) -> AdminConsoleRepair {
        let mut repair = AdminConsoleRepair::default();

        if self.find_middleware(ADMIN_CONSOLE_LOGIN_ID).is_none() {
            let password = Alphanumeric.sample_string(&mut rand::thread_rng(), 16);
            let mut login = Middleware::new(ADMIN_CONSOLE_LOGIN_ID, MiddlewareType::HttpDigestAuth);
            login.set_password(ADMIN_CONSOLE_USER, &password);
            self.middlewares.push(login);
            repair.generated_password = Some(password);
            repair.changed = true;
        }

        let exitpoint_index = match self
            .exitpoints
            .iter()
            .position(|e| e.kind == ExitpointType::AdminConsole)
        {
            Some(index) => index,
            None => {
                self.exitpoints.push(Exitpoint::new(
                    ADMIN_CONSOLE_EXITPOINT_NAME,
                    "*",
                    ExitpointType::AdminConsole,
                ));
                repair.changed = true;
                self.exitpoints.len() - 1
            }
        };

        let exitpoint = &mut self.exitpoints[exitpoint_index];
        if exitpoint.name.trim().is_empty() {
            exitpoint.name = ADMIN_CONSOLE_EXITPOINT_NAME.to_string();
            repair.changed = true;
        }
        if exitpoint.host.trim().is_empty() {
            exitpoint.host = "*".to_string();
            repair.changed = true;
        }
        if !exitpoint.middlewares.iter().any(|m| m == ADMIN_CONSOLE_LOGIN_ID) {
            exitpoint.middlewares.push(ADMIN_CONSOLE_LOGIN_ID.to_string());
            repair.changed = true;
        }
        let exitpoint_name = exitpoint.name.clone();

        let route_index = self
            .proxy_routes
            .iter()
            .position(|r| r.exitpoint_name.eq_ignore_ascii_case(&exitpoint_name));
        let mut has_route = false;
        if let Some(route_index) = route_index {
            let entrypoint_name = self.proxy_routes[route_index].entrypoint_name.clone();
            match self.entrypoints.iter_mut().find(|e| e.name.eq_ignore_ascii_case(&entrypoint_name)) {
                Some(entrypoint) => {
                    if !entrypoint.http_enabled() && !entrypoint.https_enabled() {
                        entrypoint.http_port = ADMIN_CONSOLE_PORT;
                        entrypoint.https_port = ADMIN_CONSOLE_PORT;
                        entrypoint.ip_address.clear();
                        repair.changed = true;
                    }
                    has_route = true;
                }
                None => {
                    // Broken route; drop it so it is recreated predictably below.
                    self.proxy_routes.remove(route_index);
                    repair.changed = true;
                }
            }
        }

        if !has_route {
            let entrypoint_name = match self
                .entrypoints
                .iter()
                .find(|e| e.http_port == ADMIN_CONSOLE_PORT || e.https_port == ADMIN_CONSOLE_PORT)
            {
                Some(existing) => existing.name.clone(),
                None => {
                    let mut entrypoint = Entrypoint::new(ADMIN_CONSOLE_ENTRYPOINT_NAME);
                    entrypoint.http_port = ADMIN_CONSOLE_PORT;
                    entrypoint.https_port = ADMIN_CONSOLE_PORT;
                    self.entrypoints.push(entrypoint);
                    ADMIN_CONSOLE_ENTRYPOINT_NAME.to_string()
                }
            };
            self.proxy_routes.push(ProxyRoute::new(entrypoint_name, exitpoint_name));
            repair.changed = true;
        }

        repair
    }
}

fn validate_middleware_payload(m: &Middleware) -> Result<(), SettingsError> {
    match m.kind {
        MiddlewareType::IpWhitelist | MiddlewareType::TrustedProxyIpRanges => {
            IpRangeSet::parse(&m.whitelisted_ip_ranges).map_err(|e| {
                invalid(format!("Middleware \"{}\" defines an invalid IP range: {}", m.id, e))
            })?;
        }
        MiddlewareType::HttpDigestAuth => {
            for c in &m.auth_credentials {
                if c.user.trim().is_empty() {
                    return Err(invalid(format!(
                        "Middleware \"{}\" defines invalid credential (missing username)",
                        m.id
                    )));
                }
                if c.pass.is_empty() {
                    return Err(invalid(format!(
                        "Middleware \"{}\" defines invalid credential (missing password)",
                        m.id
                    )));
                }
            }
        }
        MiddlewareType::AddHttpHeaderToRequest | MiddlewareType::AddHttpHeaderToResponse => {
            for line in m.http_headers.iter().filter(|l| !l.trim().is_empty()) {
                parse_header_line(line).map_err(|e| {
                    invalid(format!("Middleware \"{}\" failed HTTP header validation: {}", m.id, e))
                })?;
            }
        }
        MiddlewareType::RemoveHttpHeaderFromRequest | MiddlewareType::RemoveHttpHeaderFromResponse => {
            for line in m.http_headers.iter().filter(|l| !l.trim().is_empty()) {
                parse_header_name(line).map_err(|e| {
                    invalid(format!("Middleware \"{}\" failed HTTP header validation: {}", m.id, e))
                })?;
            }
        }
        MiddlewareType::RegexReplaceInResponse => {
            if m.regex_pattern.is_empty() {
                return Err(invalid(format!("Middleware \"{}\" has an empty regex pattern.", m.id)));
            }
            regex::Regex::new(&m.regex_pattern).map_err(|e| {
                invalid(format!("Middleware \"{}\" has an invalid regex pattern: {}", m.id, e))
            })?;
        }
        _ => {}
    }
    Ok(())
}

fn is_absolute_http_uri(s: &str) -> bool {
    match s.parse::<Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.authority().is_some()
        }
        Err(_) => false,
    }
}

fn trim_all(ids: &mut [String]) {
    for id in ids.iter_mut() {
        *id = id.trim().to_string();
    }
}

fn invalid(message: String) -> SettingsError {
    SettingsError::Invalid(message)
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u32 {
    10
}

fn default_network_timeout() -> u32 {
    15
}

fn default_max_connections() -> u32 {
    48
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_exitpoint(name: &str, host: &str) -> Exitpoint {
        let mut e = Exitpoint::new(name, host, ExitpointType::WebProxy);
        e.destination_origin = "http://127.0.0.1:3000".to_string();
        e
    }

    fn basic_settings() -> Settings {
        let mut s = Settings::default();
        let mut ep = Entrypoint::new("Public");
        ep.http_port = 80;
        ep.https_port = 443;
        s.entrypoints.push(ep);
        s.exitpoints.push(proxy_exitpoint("App", "app.example.com"));
        s.proxy_routes.push(ProxyRoute::new("Public", "App"));
        s
    }

    #[test]
    fn test_parse_settings_json() {
        let json = r#"{
            "entrypoints": [{"name": "Public", "httpPort": 80, "httpsPort": 443, "tlsCipherSuiteSet": "Modern"}],
            "exitpoints": [{
                "name": "App", "host": "app.example.com", "type": "WebProxy",
                "destinationOrigin": "http://10.0.0.2:8080", "autoCertificate": true
            }],
            "middlewares": [{"id": "Office", "type": "IpWhitelist", "whitelistedIpRanges": ["10.0.0.0/8"]}],
            "proxyRoutes": [{"entrypointName": "Public", "exitpointName": "App"}],
            "acmeAccountEmail": "ops@example.com"
        }"#;

        let mut s: Settings = serde_json::from_str(json).unwrap();
        s.validate().unwrap();

        assert_eq!(s.entrypoints[0].tls_cipher_suite_set, TlsCipherSuiteSet::Modern);
        let app = &s.exitpoints[0];
        assert!(app.use_connection_keep_alive);
        assert!(app.allow_generate_self_signed_certificate);
        assert_eq!(app.connect_timeout_sec, 10);
        assert_eq!(app.network_timeout_sec, 15);
        assert_eq!(s.server_max_connection_count, 48);
        assert_eq!(s.middlewares[0].proxy_header_behavior, ProxyHeaderBehavior::Drop);
    }

    #[test]
    fn test_validate_trims_names_and_references() {
        let mut s = basic_settings();
        s.entrypoints[0].name = "  Public ".to_string();
        s.middlewares.push(Middleware::new(" Timing ", MiddlewareType::AddProxyServerTiming));
        s.exitpoints[0].middlewares.push("Timing  ".to_string());
        s.proxy_routes[0].entrypoint_name = "Public ".to_string();

        s.validate().unwrap();
        assert_eq!(s.entrypoints[0].name, "Public");
        assert_eq!(s.middlewares[0].id, "Timing");
        assert_eq!(s.exitpoints[0].middlewares, vec!["Timing".to_string()]);
        assert_eq!(s.proxy_routes[0].entrypoint_name, "Public");
    }

    #[test]
    fn test_validate_rejects_duplicate_names_case_insensitively() {
        let mut s = basic_settings();
        s.exitpoints.push(proxy_exitpoint("app", "other.example.com"));
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("Exitpoint names are not unique"), "{}", err);
    }

    #[test]
    fn test_validate_requires_email_for_auto_certificate() {
        let mut s = basic_settings();
        s.exitpoints[0].auto_certificate = true;
        assert!(s.validate().unwrap_err().to_string().contains("ACME account email"));

        s.acme_account_email = "ops@example.com".to_string();
        s.validate().unwrap();
    }

    #[test]
    fn test_validate_web_proxy_origin() {
        let mut s = basic_settings();
        s.exitpoints[0].destination_origin = "/relative".to_string();
        assert!(s.validate().unwrap_err().to_string().contains("Destination Origin"));

        let mut s = basic_settings();
        s.exitpoints[0].destination_origin = "ftp://files.example.com".to_string();
        assert!(s.validate().is_err());

        let mut s = basic_settings();
        s.exitpoints[0].destination_host_header = "bad host".to_string();
        assert!(s.validate().unwrap_err().to_string().contains("Host Header"));
    }

    #[test]
    fn test_validate_clamps_limits() {
        let mut s = basic_settings();
        s.exitpoints[0].connect_timeout_sec = 0;
        s.exitpoints[0].network_timeout_sec = 10_000;
        s.server_max_connection_count = 1;
        s.validate().unwrap();
        assert_eq!(s.exitpoints[0].connect_timeout_sec, 1);
        assert_eq!(s.exitpoints[0].network_timeout_sec, 600);
        assert_eq!(s.server_max_connection_count, 8);
    }

    #[test]
    fn test_validate_middleware_payloads() {
        let mut s = basic_settings();
        let mut m = Middleware::new("Bad Range", MiddlewareType::IpWhitelist);
        m.whitelisted_ip_ranges.push("10.0.0.300".to_string());
        s.middlewares.push(m);
        assert!(s.validate().unwrap_err().to_string().contains("Bad Range"));

        let mut s = basic_settings();
        let mut m = Middleware::new("Login", MiddlewareType::HttpDigestAuth);
        m.set_password("bob", "");
        s.middlewares.push(m);
        assert!(s.validate().unwrap_err().to_string().contains("missing password"));

        let mut s = basic_settings();
        let mut m = Middleware::new("Headers", MiddlewareType::AddHttpHeaderToResponse);
        m.http_headers.push("NoSeparator".to_string());
        s.middlewares.push(m);
        assert!(s.validate().is_err());

        let mut s = basic_settings();
        let mut m = Middleware::new("Rewrite", MiddlewareType::RegexReplaceInResponse);
        m.regex_pattern = "(unclosed".to_string();
        s.middlewares.push(m);
        assert!(s.validate().unwrap_err().to_string().contains("regex"));
    }

    #[test]
    fn test_validate_rejects_unknown_middleware_reference() {
        let mut s = basic_settings();
        s.entrypoints[0].middlewares.push("Missing".to_string());
        assert!(s.validate().unwrap_err().to_string().contains("non-existent Middleware"));
    }

    #[test]
    fn test_validate_routes() {
        let mut s = basic_settings();
        s.proxy_routes.push(ProxyRoute::new("public", "app"));
        assert!(s.validate().unwrap_err().to_string().contains("not unique"));

        let mut s = basic_settings();
        s.proxy_routes.push(ProxyRoute::new("Public", "Nowhere"));
        assert!(s.validate().unwrap_err().to_string().contains("non-existent Exitpoint"));
    }

    #[test]
    fn test_route_names_resolve_ignoring_case() {
        let mut s = basic_settings();
        s.proxy_routes[0] = ProxyRoute::new("PUBLIC", "app");
        s.validate().unwrap();

        let routed: Vec<&str> = s.routed_exitpoints("Public").map(|e| e.name.as_str()).collect();
        assert_eq!(routed, vec!["App"]);
        let routed: Vec<&str> = s.routed_entrypoints("APP").map(|e| e.name.as_str()).collect();
        assert_eq!(routed, vec!["Public"]);
        assert_eq!(s.find_entrypoint("public").unwrap().name, "Public");
    }

    #[test]
    fn test_validate_singleton_middleware_per_route() {
        let mut s = basic_settings();
        s.middlewares.push(Middleware::new("Redirect A", MiddlewareType::RedirectHttpToHttps));
        s.middlewares.push(Middleware::new("Redirect B", MiddlewareType::RedirectHttpToHttps));
        s.entrypoints[0].middlewares.push("Redirect A".to_string());
        s.exitpoints[0].middlewares.push("Redirect B".to_string());
        assert!(s.validate().unwrap_err().to_string().contains("more than one"));

        // The same middleware on both ends counts once.
        s.exitpoints[0].middlewares = vec!["Redirect A".to_string()];
        s.validate().unwrap();
    }

    #[test]
    fn test_ensure_admin_console_creates_everything() {
        let mut s = Settings::default();
        let repair = s.ensure_admin_console();
        assert!(repair.changed);
        assert_eq!(repair.generated_password.as_ref().map(String::len), Some(16));

        let login = s.find_middleware(ADMIN_CONSOLE_LOGIN_ID).unwrap();
        assert_eq!(login.kind, MiddlewareType::HttpDigestAuth);
        assert_eq!(login.auth_credentials[0].user, ADMIN_CONSOLE_USER);

        let exit = s.find_exitpoint(ADMIN_CONSOLE_EXITPOINT_NAME).unwrap();
        assert_eq!(exit.kind, ExitpointType::AdminConsole);
        assert_eq!(exit.host, "*");

        let entry = s.find_entrypoint(ADMIN_CONSOLE_ENTRYPOINT_NAME).unwrap();
        assert_eq!(entry.http_port, ADMIN_CONSOLE_PORT);
        assert_eq!(entry.https_port, ADMIN_CONSOLE_PORT);
        assert_eq!(
            s.routed_exitpoints(ADMIN_CONSOLE_ENTRYPOINT_NAME).count(),
            1
        );
        s.validate().unwrap();
    }

    #[test]
    fn test_ensure_admin_console_is_idempotent() {
        let mut s = basic_settings();
        assert!(s.ensure_admin_console().changed);
        let after_first = s.clone();

        let second = s.ensure_admin_console();
        assert_eq!(second, AdminConsoleRepair::default());
        assert_eq!(s, after_first);
    }

    #[test]
    fn test_ensure_admin_console_repairs_broken_route() {
        let mut s = Settings::default();
        s.ensure_admin_console();
        s.entrypoints.clear();

        let repair = s.ensure_admin_console();
        assert!(repair.changed);
        assert!(repair.generated_password.is_none());
        assert_eq!(s.proxy_routes.len(), 1);
        assert!(s.find_entrypoint(ADMIN_CONSOLE_ENTRYPOINT_NAME).is_some());
    }

    #[test]
    fn test_ensure_admin_console_reuses_port_8080_entrypoint() {
        let mut s = Settings::default();
        let mut ep = Entrypoint::new("Intranet");
        ep.https_port = ADMIN_CONSOLE_PORT;
        s.entrypoints.push(ep);

        s.ensure_admin_console();
        assert_eq!(s.entrypoints.len(), 1);
        assert_eq!(s.proxy_routes[0].entrypoint_name, "Intranet");
    }

    #[test]
    fn test_exitpoint_domains_and_hostname_match() {
        let e = proxy_exitpoint("Site", "*.example.com, www.example.com example.org");
        assert_eq!(e.all_domains(), vec!["*.example.com", "www.example.com", "example.org"]);
        assert_eq!(e.hostname_match("www.example.com"), Some("www.example.com"));
        assert_eq!(e.hostname_match("api.example.com"), Some("*.example.com"));
        assert_eq!(e.host_match("example.org"), Some(MatchKind::Exact));
        assert_eq!(e.host_match("example.net"), None);
    }

    #[test]
    fn test_middlewares_for_route_in_settings_order() {
        let mut s = basic_settings();
        s.middlewares.push(Middleware::new("First", MiddlewareType::XForwardedFor));
        s.middlewares.push(Middleware::new("Second", MiddlewareType::AddProxyServerTiming));
        s.middlewares.push(Middleware::new("Unused", MiddlewareType::XRealIp));
        s.exitpoints[0].middlewares.push("Second".to_string());
        s.entrypoints[0].middlewares.push("First".to_string());

        let ids: Vec<&str> = s
            .middlewares_for(&s.entrypoints[0], &s.exitpoints[0])
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["First", "Second"]);
    }
}

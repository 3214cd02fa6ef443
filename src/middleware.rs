//! The per-request middleware pipeline
//!
//! Middlewares attached to the resolved entrypoint and exitpoint are applied in
//! a fixed order: HTTPS redirect, IP whitelist, digest authentication, then
//! header, forwarded-header and body-rewrite policies that the dispatcher
//! carries out while proxying.

use crate::digest::{DigestAuth, DigestFailure};
use crate::iprange::IpRangeSet;
use crate::routing::Route;
use crate::settings::{Middleware, MiddlewareType, ProxyHeaderBehavior, Settings};
use dashmap::DashMap;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use hyper::{Request, Uri};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

/// Connection facts the pipeline needs
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub secure: bool,
    /// Requested hostname, lowercased, without port
    pub host: String,
}

impl RequestContext {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Substitute `$remote_addr`, `$remote_port`, `$scheme`, `$server_name`
    /// and `$server_port` in a header value
    pub fn expand_macros(&self, value: &str) -> String {
        if !value.contains('$') {
            return value.to_string();
        }
        value
            .replace("$remote_addr", &self.peer.ip().to_string())
            .replace("$remote_port", &self.peer.port().to_string())
            .replace("$scheme", self.scheme())
            .replace("$server_name", &self.host)
            .replace("$server_port", &self.local.port().to_string())
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Answer with a redirect to this location
    Redirect(String),
    /// Close the connection without a response
    Drop,
    /// Answer 401 with this `WWW-Authenticate` value
    Unauthorized(String),
    /// Dispatch to the exitpoint with this plan
    Continue(DispatchPlan),
}

#[derive(Debug, Clone)]
pub enum HeaderEdit {
    Set(HeaderName, String),
    Remove(HeaderName),
}

#[derive(Debug, Clone)]
pub enum BodyRewrite {
    /// Replace the upstream host name with the requested one
    Hostname { from: String, to: String },
    Regex { pattern: Regex, replacement: String },
}

/// Everything the dispatcher applies while handling an admitted request
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    pub user: Option<String>,
    pub request_headers: Vec<HeaderEdit>,
    pub response_headers: Vec<HeaderEdit>,
    pub server_timing: bool,
    pub forwarded: ForwardedPolicy,
    pub body_rewrites: Vec<BodyRewrite>,
}

/// Run the pipeline for a request whose route has been resolved
pub fn run<B>(
    settings: &Settings,
    route: Route<'_>,
    ctx: &RequestContext,
    req: &Request<B>,
    digest: &DigestAuth,
) -> PipelineOutcome {
    let middlewares = settings.middlewares_for(route.entrypoint, route.exitpoint);
    let of_kind = |kind: MiddlewareType| middlewares.iter().copied().filter(move |m| m.kind == kind);

    if !ctx.secure && route.entrypoint.https_enabled() && of_kind(MiddlewareType::RedirectHttpToHttps).next().is_some() {
        return PipelineOutcome::Redirect(https_location(req.uri(), &ctx.host, route.entrypoint.https_port));
    }

    if !peer_allowed(&middlewares, ctx.peer.ip()) {
        return PipelineOutcome::Drop;
    }

    let mut plan = DispatchPlan::default();

    let mut logins = of_kind(MiddlewareType::HttpDigestAuth).peekable();
    if logins.peek().is_some() {
        let realm = ctx.host.as_str();
        let authorization = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let result = match authorization {
            Some(header) => digest.verify(
                header,
                req.method().as_str(),
                req.uri().path_and_query().map_or("/", |pq| pq.as_str()),
                realm,
                logins.flat_map(|m| m.auth_credentials.iter()),
            ),
            None => Err(DigestFailure::Rejected),
        };
        match result {
            Ok(user) => plan.user = Some(user.to_string()),
            Err(failure) => {
                return PipelineOutcome::Unauthorized(digest.challenge(realm, failure == DigestFailure::Stale))
            }
        }
    }

    plan.server_timing = of_kind(MiddlewareType::AddProxyServerTiming).next().is_some();

    for m in &middlewares {
        match m.kind {
            MiddlewareType::AddHttpHeaderToRequest => plan.request_headers.extend(set_edits(m)),
            MiddlewareType::AddHttpHeaderToResponse => plan.response_headers.extend(set_edits(m)),
            MiddlewareType::RemoveHttpHeaderFromRequest => plan.request_headers.extend(remove_edits(m)),
            MiddlewareType::RemoveHttpHeaderFromResponse => plan.response_headers.extend(remove_edits(m)),
            _ => {}
        }
    }

    let behavior = |kind| of_kind(kind).next().map(|m| m.proxy_header_behavior).unwrap_or_default();
    let mut trusted = of_kind(MiddlewareType::TrustedProxyIpRanges).peekable();
    let trusted = trusted.peek().is_some().then(|| union_ranges(trusted));
    plan.forwarded = ForwardedPolicy {
        for_: behavior(MiddlewareType::XForwardedFor),
        host: behavior(MiddlewareType::XForwardedHost),
        proto: behavior(MiddlewareType::XForwardedProto),
        real_ip: behavior(MiddlewareType::XRealIp),
        trusted,
    };

    for m in &middlewares {
        match m.kind {
            MiddlewareType::HostnameSubstitution => {
                let upstream = route
                    .exitpoint
                    .destination_origin
                    .parse::<Uri>()
                    .ok()
                    .and_then(|u| u.host().map(str::to_string));
                if let Some(from) = upstream {
                    if !from.eq_ignore_ascii_case(&ctx.host) {
                        plan.body_rewrites.push(BodyRewrite::Hostname { from, to: ctx.host.clone() });
                    }
                }
            }
            MiddlewareType::RegexReplaceInResponse => {
                if let Some(pattern) = cached_regex(&m.regex_pattern) {
                    plan.body_rewrites.push(BodyRewrite::Regex {
                        pattern,
                        replacement: m.regex_replacement.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    PipelineOutcome::Continue(plan)
}

/// Whether the IP whitelists among `middlewares` admit `ip`. Without any
/// whitelist every client is admitted; with several, one match is enough.
pub fn peer_allowed(middlewares: &[&Middleware], ip: IpAddr) -> bool {
    let mut whitelists = middlewares
        .iter()
        .copied()
        .filter(|m| m.kind == MiddlewareType::IpWhitelist)
        .peekable();
    if whitelists.peek().is_none() {
        return true;
    }
    union_ranges(whitelists).contains(ip)
}

fn https_location(uri: &Uri, host: &str, https_port: u16) -> String {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    }
}

fn union_ranges<'a>(middlewares: impl Iterator<Item = &'a Middleware>) -> IpRangeSet {
    let mut set = IpRangeSet::default();
    for m in middlewares {
        // Ranges were validated on save; anything unparseable grants nothing.
        if let Ok(ranges) = IpRangeSet::parse(&m.whitelisted_ip_ranges) {
            set.extend(ranges);
        }
    }
    set
}

fn set_edits(m: &Middleware) -> impl Iterator<Item = HeaderEdit> + '_ {
    m.http_headers
        .iter()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| parse_header_line(l).ok())
        .map(|(name, value)| HeaderEdit::Set(name, value))
}

fn remove_edits(m: &Middleware) -> impl Iterator<Item = HeaderEdit> + '_ {
    m.http_headers
        .iter()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| parse_header_name(l).ok())
        .map(HeaderEdit::Remove)
}

/// Parse a `Name: value` header line. Spaces after the colon are dropped.
pub fn parse_header_line(line: &str) -> Result<(HeaderName, String), String> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| format!("missing ':' in header line \"{}\"", line))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| format!("invalid header name in \"{}\"", line))?;
    let value = value.trim_start_matches(' ');
    HeaderValue::from_str(value).map_err(|_| format!("invalid header value in \"{}\"", line))?;
    Ok((name, value.to_string()))
}

/// Parse the header name from a removal entry (`Name` or `Name: ignored`)
pub fn parse_header_name(line: &str) -> Result<HeaderName, String> {
    let name = line.split_once(':').map(|(n, _)| n).unwrap_or(line);
    HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| format!("invalid header name \"{}\"", line.trim()))
}

/// Apply header edits with override semantics, expanding macros
pub fn apply_header_edits(headers: &mut HeaderMap, edits: &[HeaderEdit], ctx: &RequestContext) {
    for edit in edits {
        match edit {
            HeaderEdit::Set(name, template) => {
                if let Ok(value) = HeaderValue::from_str(&ctx.expand_macros(template)) {
                    headers.insert(name.clone(), value);
                }
            }
            HeaderEdit::Remove(name) => {
                headers.remove(name);
            }
        }
    }
}

/// Handling of the four forwarding headers on the upstream request
#[derive(Debug, Clone, Default)]
pub struct ForwardedPolicy {
    pub for_: ProxyHeaderBehavior,
    pub host: ProxyHeaderBehavior,
    pub proto: ProxyHeaderBehavior,
    pub real_ip: ProxyHeaderBehavior,
    /// Peers allowed to supply forwarding headers; `None` trusts every peer
    pub trusted: Option<IpRangeSet>,
}

impl ForwardedPolicy {
    fn peer_trusted(&self, ctx: &RequestContext) -> bool {
        self.trusted.as_ref().map_or(true, |t| t.contains(ctx.peer.ip()))
    }

    /// Rewrite the forwarding headers of an outgoing request.
    ///
    /// `original_host` is the Host header the client sent.
    pub fn apply(&self, headers: &mut HeaderMap, ctx: &RequestContext, original_host: &str) {
        let trusted = self.peer_trusted(ctx);
        let client_ip = ctx.peer.ip().to_string();
        let kinds = [
            ("x-forwarded-for", self.for_, client_ip.as_str(), true),
            ("x-forwarded-host", self.host, original_host, false),
            ("x-forwarded-proto", self.proto, ctx.scheme(), false),
            ("x-real-ip", self.real_ip, client_ip.as_str(), false),
        ];
        for (name, behavior, observed, list_valued) in kinds {
            let name = HeaderName::from_static(name);
            let existing: Option<String> = {
                let values: Vec<&str> = headers.get_all(&name).iter().filter_map(|v| v.to_str().ok()).collect();
                (!values.is_empty()).then(|| values.join(", "))
            };
            let value = match behavior {
                ProxyHeaderBehavior::Drop => None,
                ProxyHeaderBehavior::Create => Some(observed.to_string()),
                ProxyHeaderBehavior::PassthroughIfTrusted => existing.filter(|_| trusted),
                ProxyHeaderBehavior::CombineIfTrustedElseCreate => match existing {
                    Some(prior) if trusted && list_valued => Some(format!("{}, {}", prior, observed)),
                    Some(prior) if trusted => Some(prior),
                    _ => Some(observed.to_string()),
                },
            };
            headers.remove(&name);
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(name, value);
            }
        }
    }
}

/// Whether a response body may be buffered and rewritten
pub fn is_rewritable_content(headers: &HeaderMap) -> bool {
    let encoded = headers
        .get(hyper::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false);
    if encoded {
        return false;
    }
    let content_type = match headers.get(hyper::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) => ct.to_ascii_lowercase(),
        None => return false,
    };
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || mime.ends_with("+json")
        || matches!(
            mime,
            "application/json" | "application/javascript" | "application/xml" | "application/x-javascript"
        )
}

/// Apply body rewrites in order
pub fn rewrite_body(body: &str, rewrites: &[BodyRewrite]) -> String {
    let mut out = body.to_string();
    for rewrite in rewrites {
        out = match rewrite {
            BodyRewrite::Hostname { from, to } => replace_ignore_ascii_case(&out, from, to),
            BodyRewrite::Regex { pattern, replacement } => pattern.replace_all(&out, replacement.as_str()).into_owned(),
        };
    }
    out
}

/// Rewrite a `Location` header value for hostname substitution
pub fn rewrite_location(location: &str, rewrites: &[BodyRewrite]) -> String {
    rewrites.iter().fold(location.to_string(), |acc, rewrite| match rewrite {
        BodyRewrite::Hostname { from, to } => replace_ignore_ascii_case(&acc, from, to),
        BodyRewrite::Regex { .. } => acc,
    })
}

fn replace_ignore_ascii_case(haystack: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return haystack.to_string();
    }
    let lower = haystack.to_ascii_lowercase();
    let needle = from.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..start]);
        out.push_str(to);
        last = start + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

fn cached_regex(pattern: &str) -> Option<Regex> {
    static PATTERNS: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(DashMap::new);
    if let Some(re) = patterns.get(pattern) {
        return Some(re.clone());
    }
    let re = Regex::new(pattern).ok()?;
    patterns.insert(pattern.to_string(), re.clone());
    Some(re)
}

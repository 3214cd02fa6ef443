//! Hostname template and interface matching
//!
//! A host template is a hostname that may contain `*` wildcards. Each wildcard
//! matches the shortest possible span of characters, and the literal parts
//! between wildcards must appear in order, anchored at both ends. An exitpoint
//! `host` field may list several templates separated by commas or spaces.

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use std::net::IpAddr;
use std::sync::OnceLock;

/// How a hostname or interface matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Literal match (or a specific configured IP address)
    Exact,
    /// Matched through a wildcard (or an "any interface" entrypoint)
    Wildcard,
}

impl MatchKind {
    pub fn is_exact(self) -> bool {
        self == MatchKind::Exact
    }
}

/// Split a `host` field into its individual templates
pub fn host_templates(host: &str) -> impl Iterator<Item = &str> {
    host.split([',', ' ']).map(str::trim).filter(|t| !t.is_empty())
}

/// Match a requested hostname against a host field.
///
/// The field may hold several templates; the result is exact if any literal
/// template equals the hostname, otherwise a wildcard match if any wildcard
/// template matches.
pub fn match_host(requested: &str, template: &str) -> Option<MatchKind> {
    let mut best = None;
    for sub in host_templates(template) {
        match match_single(requested, sub) {
            Some(MatchKind::Exact) => return Some(MatchKind::Exact),
            Some(MatchKind::Wildcard) => best = Some(MatchKind::Wildcard),
            None => {}
        }
    }
    best
}

/// Pick the best template for a hostname: the first exact match wins, otherwise
/// the first wildcard match in list order.
pub fn match_hostname_best<'a>(requested: &str, templates: &[&'a str]) -> Option<(&'a str, MatchKind)> {
    let mut wildcard = None;
    for template in templates {
        match match_single(requested, template) {
            Some(MatchKind::Exact) => return Some((*template, MatchKind::Exact)),
            Some(MatchKind::Wildcard) if wildcard.is_none() => wildcard = Some(*template),
            _ => {}
        }
    }
    wildcard.map(|t| (t, MatchKind::Wildcard))
}

/// Match the local interface address of a connection against an entrypoint's
/// configured IP address. An empty configuration listens everywhere.
pub fn match_interface(bound: IpAddr, configured: &str) -> Option<MatchKind> {
    let configured = configured.trim();
    if configured.is_empty() {
        return Some(MatchKind::Wildcard);
    }
    let configured: IpAddr = configured.parse().ok()?;
    (configured.to_canonical() == bound.to_canonical()).then_some(MatchKind::Exact)
}

fn match_single(requested: &str, template: &str) -> Option<MatchKind> {
    if template == "*" {
        return Some(MatchKind::Wildcard);
    }
    if !template.contains('*') {
        return requested
            .eq_ignore_ascii_case(template)
            .then_some(MatchKind::Exact);
    }
    wildcard_regex(template)
        .filter(|re| re.is_match(requested))
        .map(|_| MatchKind::Wildcard)
}

/// Compiled patterns keyed by template. Templates come from configuration, so
/// the map stays as small as the configured host list.
fn wildcard_regex(template: &str) -> Option<Regex> {
    static PATTERNS: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(DashMap::new);

    if let Some(re) = patterns.get(template) {
        return Some(re.clone());
    }

    let body = template
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*?");
    let re = RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
        .ok()?;
    patterns.insert(template.to_string(), re.clone());
    Some(re)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_template() {
        let t = "www.example.com";
        assert_eq!(match_host("www.example.com", t), Some(MatchKind::Exact));
        assert_eq!(match_host("WWW.Example.COM", t), Some(MatchKind::Exact));
        assert_eq!(match_host("example.com", t), None);
        assert_eq!(match_host("www.example", t), None);
        assert_eq!(match_host("testexample.com", t), None);
        assert_eq!(match_host("www.example.org", t), None);
    }

    #[test]
    fn test_leading_subdomain_wildcard() {
        let t = "*.example.com";
        assert_eq!(match_host("www.example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("example.com", t), None);
        assert_eq!(match_host("testexample.com", t), None);
        assert_eq!(match_host("www.example.org", t), None);
    }

    #[test]
    fn test_leading_bare_wildcard() {
        let t = "*example.com";
        assert_eq!(match_host("www.example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("testexample.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("www.example", t), None);
        assert_eq!(match_host("www.example.org", t), None);
    }

    #[test]
    fn test_trailing_wildcard() {
        let t = "example.*";
        assert_eq!(match_host("example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("www.example.com", t), None);
        assert_eq!(match_host("www.example", t), None);
    }

    #[test]
    fn test_two_wildcards() {
        let t = "*example.*";
        assert_eq!(match_host("www.example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("example.com", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("www.example.org", t), Some(MatchKind::Wildcard));
        assert_eq!(match_host("www.example", t), None);
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert_eq!(match_host("wwwXexample.com", "*.example.com"), None);
        assert_eq!(match_host("a+b.example.com", "a+b.*"), Some(MatchKind::Wildcard));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        for host in ["a", "example.com", "x.y.z.test", ""] {
            assert_eq!(match_host(host, "*"), Some(MatchKind::Wildcard));
        }
    }

    #[test]
    fn test_multiple_templates_in_one_field() {
        let field = "*.example.com,example.com";
        assert_eq!(match_host("api.example.com", field), Some(MatchKind::Wildcard));
        assert_eq!(match_host("example.com", field), Some(MatchKind::Exact));
        assert_eq!(match_host("other.com", field), None);

        let spaced = "a.test  b.test";
        assert_eq!(match_host("b.test", spaced), Some(MatchKind::Exact));
    }

    #[test]
    fn test_exact_outranks_earlier_wildcard() {
        let templates = ["*.example.com", "www.example.com"];
        assert_eq!(
            match_hostname_best("www.example.com", &templates),
            Some(("www.example.com", MatchKind::Exact))
        );
        assert_eq!(
            match_hostname_best("api.example.com", &templates),
            Some(("*.example.com", MatchKind::Wildcard))
        );
        assert_eq!(match_hostname_best("example.org", &templates), None);
    }

    #[test]
    fn test_first_wildcard_wins_among_wildcards() {
        let templates = ["*.com", "*.example.com"];
        assert_eq!(
            match_hostname_best("www.example.com", &templates),
            Some(("*.com", MatchKind::Wildcard))
        );
    }

    #[test]
    fn test_match_interface() {
        let v4: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(match_interface(v4, ""), Some(MatchKind::Wildcard));
        assert_eq!(match_interface(v4, "  "), Some(MatchKind::Wildcard));
        assert_eq!(match_interface(v4, "10.0.0.5"), Some(MatchKind::Exact));
        assert_eq!(match_interface(v4, "10.0.0.6"), None);
        assert_eq!(match_interface(v4, "not-an-ip"), None);

        let mapped: IpAddr = "::ffff:10.0.0.5".parse().unwrap();
        assert_eq!(match_interface(mapped, "10.0.0.5"), Some(MatchKind::Exact));
    }
}

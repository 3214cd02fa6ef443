//! HTTP Digest authentication (RFC 7616, MD5, qop=auth)
//!
//! Nonces are stateless: a timestamp followed by an HMAC of the timestamp and
//! realm, so any worker can check a nonce without shared storage.

use crate::settings::Credential;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// How long a nonce stays acceptable
const NONCE_LIFETIME: Duration = Duration::from_secs(3600);

pub struct DigestAuth {
    secret: [u8; 32],
}

impl Default for DigestAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestAuth {
    pub fn new() -> Self {
        Self {
            secret: rand::thread_rng().gen(),
        }
    }

    /// Value for a `WWW-Authenticate` header
    pub fn challenge(&self, realm: &str, stale: bool) -> String {
        let mut value = format!(
            "Digest realm=\"{}\", qop=\"auth\", algorithm=MD5, nonce=\"{}\"",
            escape(realm),
            self.make_nonce(realm, now_secs())
        );
        if stale {
            value.push_str(", stale=true");
        }
        value
    }

    /// Check an `Authorization` header against a credential list.
    ///
    /// Returns the user name of the first credential that verifies.
    pub fn verify<'a>(
        &self,
        authorization: &str,
        method: &str,
        request_uri: &str,
        realm: &str,
        credentials: impl IntoIterator<Item = &'a Credential>,
    ) -> Result<&'a str, DigestFailure> {
        let params = parse_authorization(authorization).ok_or(DigestFailure::Malformed)?;
        let field = |name: &str| params.get(name).map(String::as_str);

        let username = field("username").ok_or(DigestFailure::Malformed)?;
        let nonce = field("nonce").ok_or(DigestFailure::Malformed)?;
        let uri = field("uri").ok_or(DigestFailure::Malformed)?;
        let response = field("response").ok_or(DigestFailure::Malformed)?;
        if field("realm") != Some(realm) || !uri_matches(uri, request_uri) {
            return Err(DigestFailure::Rejected);
        }
        if !self.nonce_is_fresh(nonce, realm, now_secs())? {
            return Err(DigestFailure::Stale);
        }

        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        for credential in credentials {
            if credential.user != username {
                continue;
            }
            let ha1 = md5_hex(&format!("{}:{}:{}", credential.user, realm, credential.pass));
            let expected = match field("qop") {
                Some(qop) => {
                    let nc = field("nc").ok_or(DigestFailure::Malformed)?;
                    let cnonce = field("cnonce").ok_or(DigestFailure::Malformed)?;
                    md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
                }
                None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
            };
            if constant_time_compare(&expected, response) {
                return Ok(&credential.user);
            }
        }
        Err(DigestFailure::Rejected)
    }

    fn make_nonce(&self, realm: &str, timestamp: u64) -> String {
        format!("{:x}-{}", timestamp, self.sign(realm, timestamp))
    }

    /// `Ok(false)` for an authentic but expired nonce
    fn nonce_is_fresh(&self, nonce: &str, realm: &str, now: u64) -> Result<bool, DigestFailure> {
        let (ts, sig) = nonce.split_once('-').ok_or(DigestFailure::Rejected)?;
        let timestamp = u64::from_str_radix(ts, 16).map_err(|_| DigestFailure::Rejected)?;
        if !constant_time_compare(&self.sign(realm, timestamp), sig) {
            return Err(DigestFailure::Rejected);
        }
        Ok(now.saturating_sub(timestamp) <= NONCE_LIFETIME.as_secs())
    }

    fn sign(&self, realm: &str, timestamp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(format!("{}:{}", timestamp, realm).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// The `uri` a client signed must name the request target, either verbatim or
/// as an absolute URI with the same path and query
fn uri_matches(signed: &str, request_uri: &str) -> bool {
    if signed == request_uri {
        return true;
    }
    signed
        .parse::<hyper::Uri>()
        .ok()
        .filter(|uri| uri.scheme().is_some())
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str() == request_uri))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestFailure {
    /// Not a parseable Digest header
    Malformed,
    /// Authentic nonce past its lifetime; the client may retry silently
    Stale,
    /// Wrong credentials, realm or forged nonce
    Rejected,
}

fn parse_authorization(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim();
    let (scheme, mut rest) = rest.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }

    let mut params = HashMap::new();
    loop {
        rest = rest.trim_start_matches([' ', ',']);
        if rest.is_empty() {
            break;
        }
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    _ => value.push(c),
                }
            }
            (value, &quoted[end? + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim().to_string(), &after[end..])
        };

        params.insert(key, value);
        rest = remaining;
    }
    Some(params)
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Vec<Credential> {
        vec![
            Credential { user: "alice".into(), pass: "wonderland".into() },
            Credential { user: "bob".into(), pass: "builder".into() },
        ]
    }

    fn nonce_from(challenge: &str) -> String {
        let start = challenge.find("nonce=\"").unwrap() + 7;
        let end = challenge[start..].find('"').unwrap() + start;
        challenge[start..end].to_string()
    }

    fn client_header(user: &str, pass: &str, realm: &str, nonce: &str, method: &str, uri: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", user, realm, pass));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let response = md5_hex(&format!("{}:{}:00000001:abcdef:auth:{}", ha1, nonce, ha2));
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop=auth, nc=00000001, cnonce=\"abcdef\", response=\"{}\"",
            user, realm, nonce, uri, response
        )
    }

    #[test]
    fn test_valid_credentials() {
        let auth = DigestAuth::new();
        let nonce = nonce_from(&auth.challenge("app.test", false));
        let header = client_header("bob", "builder", "app.test", &nonce, "GET", "/private");

        assert_eq!(auth.verify(&header, "GET", "/private", "app.test", &creds()), Ok("bob"));
    }

    #[test]
    fn test_signed_uri_must_match_request() {
        let auth = DigestAuth::new();
        let nonce = nonce_from(&auth.challenge("app.test", false));
        let header = client_header("bob", "builder", "app.test", &nonce, "GET", "/private?page=2");

        assert_eq!(
            auth.verify(&header, "GET", "/admin", "app.test", &creds()),
            Err(DigestFailure::Rejected)
        );
        assert_eq!(
            auth.verify(&header, "GET", "/private", "app.test", &creds()),
            Err(DigestFailure::Rejected)
        );
        assert_eq!(auth.verify(&header, "GET", "/private?page=2", "app.test", &creds()), Ok("bob"));
    }

    #[test]
    fn test_uri_matches_absolute_form() {
        assert!(uri_matches("/a?b=1", "/a?b=1"));
        assert!(uri_matches("https://app.test/a?b=1", "/a?b=1"));
        assert!(!uri_matches("https://app.test/other", "/a"));
        assert!(!uri_matches("/a", "/b"));
    }

    #[test]
    fn test_wrong_password_or_method() {
        let auth = DigestAuth::new();
        let nonce = nonce_from(&auth.challenge("app.test", false));

        let header = client_header("bob", "wrong", "app.test", &nonce, "GET", "/");
        assert_eq!(auth.verify(&header, "GET", "/", "app.test", &creds()), Err(DigestFailure::Rejected));

        let header = client_header("bob", "builder", "app.test", &nonce, "GET", "/");
        assert_eq!(auth.verify(&header, "POST", "/", "app.test", &creds()), Err(DigestFailure::Rejected));
    }

    #[test]
    fn test_realm_mismatch_and_foreign_nonce() {
        let auth = DigestAuth::new();
        let nonce = nonce_from(&auth.challenge("app.test", false));
        let header = client_header("bob", "builder", "app.test", &nonce, "GET", "/");
        assert_eq!(auth.verify(&header, "GET", "/", "other.test", &creds()), Err(DigestFailure::Rejected));

        let other = DigestAuth::new();
        assert_eq!(other.verify(&header, "GET", "/", "app.test", &creds()), Err(DigestFailure::Rejected));
    }

    #[test]
    fn test_expired_nonce_is_stale() {
        let auth = DigestAuth::new();
        let old = now_secs() - NONCE_LIFETIME.as_secs() - 10;
        let nonce = auth.make_nonce("app.test", old);
        let header = client_header("alice", "wonderland", "app.test", &nonce, "GET", "/");
        assert_eq!(auth.verify(&header, "GET", "/", "app.test", &creds()), Err(DigestFailure::Stale));
    }

    #[test]
    fn test_malformed_headers() {
        let auth = DigestAuth::new();
        assert_eq!(auth.verify("Basic YWxhZGRpbg==", "GET", "/", "r", &creds()), Err(DigestFailure::Malformed));
        assert_eq!(auth.verify("Digest username=\"x\"", "GET", "/", "r", &creds()), Err(DigestFailure::Malformed));
    }

    #[test]
    fn test_parse_authorization_quoting() {
        let params =
            parse_authorization(r#"Digest username="a\"b", realm="x, y", qop=auth, nc=00000001"#).unwrap();
        assert_eq!(params["username"], "a\"b");
        assert_eq!(params["realm"], "x, y");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], "00000001");
    }

    #[test]
    fn test_challenge_marks_stale() {
        let auth = DigestAuth::new();
        assert!(auth.challenge("r", true).ends_with("stale=true"));
        assert!(!auth.challenge("r", false).contains("stale"));
    }
}

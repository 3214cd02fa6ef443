//! Routegate - A TLS-terminating reverse proxy with hostname routing
//!
//! This library provides a reverse proxy that:
//! - Listens on configurable entrypoints (interface, HTTP and HTTPS ports)
//! - Routes each connection to an exitpoint by hostname, with `*` wildcards
//! - Runs a middleware pipeline: IP whitelists, digest authentication,
//!   HTTPS redirects, header edits, forwarded headers and body rewrites
//! - Forwards to upstream origins through pooled HTTP clients
//! - Obtains and renews certificates via ACME/Let's Encrypt (HTTP-01,
//!   TLS-ALPN-01 and DNS-01 through Cloudflare), falling back to static or
//!   self-signed certificates
//! - Serves a small JSON admin API behind its own exitpoint

pub mod acme;
pub mod admin;
pub mod cert_cache;
pub mod certfile;
pub mod config;
pub mod digest;
pub mod dns;
pub mod error;
pub mod hostmatch;
pub mod iprange;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod renewal;
pub mod routing;
pub mod settings;
pub mod store;
pub mod tls;

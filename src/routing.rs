//! Connection to entrypoint to exitpoint resolution

use crate::hostmatch;
use crate::settings::{Entrypoint, Exitpoint, Settings};
use std::net::SocketAddr;

/// A resolved exitpoint together with the entrypoint whose route produced it
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub entrypoint: &'a Entrypoint,
    pub exitpoint: &'a Exitpoint,
}

/// Entrypoints serving a local endpoint for the given protocol.
///
/// Entrypoints bound to the specific local address come before entrypoints
/// listening on every interface; configuration order is kept within each group.
pub fn resolve_entrypoints(settings: &Settings, local: SocketAddr, secure: bool) -> Vec<&Entrypoint> {
    let mut exact = Vec::new();
    let mut any = Vec::new();

    for entrypoint in &settings.entrypoints {
        if entrypoint.port_for(secure) != Some(local.port()) {
            continue;
        }
        match hostmatch::match_interface(local.ip(), &entrypoint.ip_address) {
            Some(kind) if kind.is_exact() => exact.push(entrypoint),
            Some(_) => any.push(entrypoint),
            None => {}
        }
    }

    exact.extend(any);
    exact
}

/// The exitpoint serving `host`, searched through the candidate entrypoints in
/// order.
///
/// Within one entrypoint an exact hostname match beats any wildcard match. The
/// first entrypoint that matches at all decides the result, even if a later
/// entrypoint would have matched exactly.
pub fn resolve_exitpoint<'a>(
    settings: &'a Settings,
    candidates: &[&'a Entrypoint],
    host: &str,
) -> Option<Route<'a>> {
    for &entrypoint in candidates {
        let mut wildcard = None;
        for exitpoint in settings.routed_exitpoints(&entrypoint.name) {
            match exitpoint.host_match(host) {
                Some(kind) if kind.is_exact() => return Some(Route { entrypoint, exitpoint }),
                Some(_) if wildcard.is_none() => wildcard = Some(exitpoint),
                _ => {}
            }
        }
        if let Some(exitpoint) = wildcard {
            return Some(Route { entrypoint, exitpoint });
        }
    }
    None
}

/// Resolve both steps for a connection
pub fn resolve<'a>(settings: &'a Settings, local: SocketAddr, secure: bool, host: &str) -> Option<Route<'a>> {
    let candidates = resolve_entrypoints(settings, local, secure);
    resolve_exitpoint(settings, &candidates, host)
}

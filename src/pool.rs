//! Comma-delimited address pools and relay address handling.

use rand::Rng;
use serde::Serialize;

/// Splits `raw` on commas, trims each entry and drops empty ones.
/// Order and duplicates are kept.
pub fn parse_pool(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Uniformly random member of `pool`.
pub fn pick<'a, R: Rng + ?Sized>(pool: &'a [String], rng: &mut R) -> Option<&'a str> {
    match pool.len() {
        0 => None,
        n => Some(pool[rng.gen_range(0..n)].as_str()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    Socks5,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

/// The SOCKS5/HTTP relay chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relay {
    /// Address with any `scheme://` prefix removed.
    pub address: String,
    pub kind: RelayKind,
    /// `None` when `address` is not a valid `host:port`.
    pub endpoint: Option<RelayEndpoint>,
}

impl Relay {
    /// Builds a relay from one pool entry. `force_http` wins over the scheme.
    pub fn from_candidate(candidate: &str, force_http: bool) -> Self {
        let kind = if force_http || candidate.to_ascii_lowercase().contains("http://") {
            RelayKind::Http
        } else {
            RelayKind::Socks5
        };
        let address = strip_scheme(candidate).to_string();
        let endpoint = parse_endpoint(&address);
        Self {
            address,
            kind,
            endpoint,
        }
    }
}

/// Drops everything up to and including the first `//`.
pub fn strip_scheme(address: &str) -> &str {
    match address.split_once("//") {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => address,
    }
}

/// Parses `host:port`; the last colon separates the port and a bracketed IPv6
/// host loses its brackets. Credentials before `@` are not part of the host.
pub fn parse_endpoint(address: &str) -> Option<RelayEndpoint> {
    let hostport = address.rsplit_once('@').map_or(address, |(_, hp)| hp);
    let (host, port) = hostport.rsplit_once(':')?;
    let port: u16 = port.parse().ok().filter(|&p| p != 0)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(RelayEndpoint {
        host: host.to_string(),
        port,
    })
}

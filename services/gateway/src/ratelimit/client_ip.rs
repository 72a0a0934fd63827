use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;
use ipnetwork::{IpNetwork, IpNetworkError};
use tracing::debug;

/// Forwarding headers consulted in order when the peer is a trusted proxy.
const FORWARDED_HEADERS: [&str; 5] = [
    "x-forwarded-for",
    "proxy-client-ip",
    "wl-proxy-client-ip",
    "http_client_ip",
    "http_x_forwarded_for",
];

/// Parses a trusted-proxy entry: a single address or a CIDR block.
pub fn parse_trusted_proxy(entry: &str) -> Result<IpNetwork, IpNetworkError> {
    let entry = entry.trim();
    match entry.parse::<IpAddr>() {
        Ok(addr) => Ok(IpNetwork::from(addr)),
        Err(_) => entry.parse::<IpNetwork>(),
    }
}

/// Determines the client address used as the rate-limit identity.
///
/// Forwarding headers are only honoured when the direct peer is listed as a
/// trusted proxy; anyone else could forge them.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted: Vec<IpNetwork>,
}

impl ClientIpResolver {
    pub fn new(trusted: Vec<IpNetwork>) -> Self {
        Self { trusted }
    }

    /// Builds the resolver from config entries, skipping any that do not
    /// parse. Config validation rejects those before startup.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self::new(
            entries
                .iter()
                .filter_map(|entry| parse_trusted_proxy(entry.as_ref()).ok())
                .collect(),
        )
    }

    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        let peer = canonical(peer);
        self.trusted.iter().any(|network| network.contains(peer))
    }

    pub fn resolve(&self, peer: SocketAddr, headers: &HeaderMap) -> String {
        let peer_ip = canonical(peer.ip());
        if !self.is_trusted(peer_ip) {
            return peer_ip.to_string();
        }

        for name in FORWARDED_HEADERS {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            let first = value.split(',').next().unwrap_or_default().trim();
            if first.is_empty() || first.eq_ignore_ascii_case("unknown") {
                continue;
            }
            debug!(header = name, client_ip = first, "using forwarded client address");
            return first.to_string();
        }

        peer_ip.to_string()
    }
}

/// IPv4-mapped IPv6 peers are compared as plain IPv4.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

//! Client identity for admission decisions.
//!
//! The key is best-effort: NAT and shared proxies merge distinct users, and
//! forwarding headers can be forged by anyone who can reach the server
//! directly. [`ProxyTrust`] is the knob for the latter.

use http::{HeaderMap, Request};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

/// Header set by a trusted reverse proxy to the original client IP.
pub const X_REAL_IP: &str = "x-real-ip";
/// Comma-separated chain of client and proxy addresses.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Key used when neither headers nor a peer address are available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Transport-level peer address. The HTTP server inserts this into request
/// extensions when it accepts a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// When to believe `X-Real-IP` / `X-Forwarded-For`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTrust {
    /// Always honour forwarding headers.
    ///
    /// Any client that can set HTTP headers can pick its own key, evading its
    /// quota or spending someone else's. Only safe when every request passes
    /// through a proxy that overwrites these headers.
    #[default]
    Any,
    /// Honour forwarding headers only when the direct peer is one of these.
    Only(Vec<IpAddr>),
    /// Ignore forwarding headers; key on the peer address.
    Never,
}

impl ProxyTrust {
    fn trusts(&self, peer: Option<IpAddr>) -> bool {
        match self {
            ProxyTrust::Any => true,
            ProxyTrust::Never => false,
            ProxyTrust::Only(proxies) => peer.is_some_and(|ip| proxies.contains(&ip)),
        }
    }
}

/// Derives the client key from a request.
///
/// Order: `X-Real-IP`, then the first `X-Forwarded-For` entry (both subject
/// to [`ProxyTrust`]), then the peer IP without its port, then
/// [`UNKNOWN_CLIENT`].
#[derive(Debug, Clone, Default)]
pub struct ClientKeyExtractor {
    trust: ProxyTrust,
}

impl ClientKeyExtractor {
    pub fn new(trust: ProxyTrust) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &ProxyTrust {
        &self.trust
    }

    /// Key for an `http` request, reading [`PeerAddr`] from its extensions.
    pub fn extract<B>(&self, req: &Request<B>) -> String {
        let peer = req.extensions().get::<PeerAddr>().map(|p| p.0);
        self.from_parts(req.headers(), peer)
    }

    /// Key from raw headers and an optional peer address.
    pub fn from_parts(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let peer_ip = peer.map(|addr| addr.ip());

        if self.trust.trusts(peer_ip) {
            if let Some(ip) = header_str(headers, X_REAL_IP) {
                return ip.to_string();
            }
            if let Some(first) = header_str(headers, X_FORWARDED_FOR)
                .and_then(|list| list.split(',').map(str::trim).find(|s| !s.is_empty()))
            {
                return first.to_string();
            }
        } else if headers.contains_key(X_REAL_IP) || headers.contains_key(X_FORWARDED_FOR) {
            tracing::debug!(
                target: "floodgate::admission",
                peer = ?peer_ip,
                "ignoring forwarding headers from untrusted peer"
            );
        }

        match peer_ip {
            Some(ip) => ip.to_string(),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

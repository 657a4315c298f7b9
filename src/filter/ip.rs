//! Client IP resolution for keyed rate limiting.
//!
//! # Resolution Order
//!
//! 1. `X-Forwarded-For` (first entry) or `X-Real-IP`, but only when the
//!    connection comes from a trusted proxy (or no trusted proxies are
//!    configured) and the value is a well-formed IP address
//! 2. The peer address of the connection (`ConnectInfo<SocketAddr>`)
//! 3. [`UNKNOWN_IP`]
//!
//! # IP Spoofing
//!
//! Forwarding headers are client-controlled. When the gateway is reachable
//! directly, configure `TRUSTED_PROXIES` with the CIDR ranges of your
//! reverse proxies so that headers from anyone else are ignored and the
//! connection's peer address is used instead.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Key used when no client IP can be determined.
pub const UNKNOWN_IP: &str = "0.0.0.0";

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as a single-host range. Returns `None` if the
    /// format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.parse().ok()?;
                (ip, prefix.parse::<u8>().ok()?)
            }
            None => {
                let ip: IpAddr = cidr.parse().ok()?;
                (ip, max_prefix(&ip))
            }
        };

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Configuration for trusted proxy validation.
///
/// When configured, forwarding headers are only honored for connections
/// originating within the specified CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Create a trusted proxy configuration from CIDR strings.
    ///
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Check if trusted proxy validation is enabled (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether forwarding headers sent by `peer` may be believed.
    ///
    /// Without configured ranges every peer is trusted. With ranges, an
    /// unknown peer is never trusted.
    pub fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        match peer {
            Some(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            None => false,
        }
    }
}

/// First client address named by the forwarding headers, if any.
///
/// Values that do not parse as an IP address are ignored, so a client cannot
/// mint new rate limit keys by sending arbitrary header text.
fn forwarded_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        match first_ip.parse::<IpAddr>() {
            Ok(ip) => return Some(ip),
            Err(_) => debug!(value = %first_ip, "Ignoring malformed X-Forwarded-For"),
        }
    }

    let real_ip = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())?;

    match real_ip.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            debug!(value = %real_ip, "Ignoring malformed X-Real-IP");
            None
        }
    }
}

/// Peer address recorded by `into_make_service_with_connect_info`.
fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client IP of a request.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` when nothing identifies the client.
pub fn resolve_client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_ip(req);

    if let Some(ip) = forwarded_ip(req) {
        if trusted_proxies.is_trusted(peer) {
            return Cow::Owned(ip.to_string());
        }
        debug!(
            forwarded = %ip,
            peer = ?peer,
            "Ignoring forwarding headers from untrusted peer"
        );
    }

    match peer {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// Client identity extraction.
///
/// The engine keys everything on the client IP. When the node sits
/// behind a proxy the real client arrives in a forwarding header, but a
/// header is only believed when the direct peer is a trusted proxy;
/// otherwise an attacker could pick their own identity and dodge every
/// per-client counter.
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::IpConfig;
use crate::pipeline::RequestDescriptor;

/// Where the resolved client IP came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSource {
    TrustedHeader { ip: String, header: String },
    DirectConnection { ip: String },
}

impl IpSource {
    pub fn ip(&self) -> &str {
        match self {
            IpSource::TrustedHeader { ip, .. } => ip,
            IpSource::DirectConnection { ip } => ip,
        }
    }
}

/// Resolve the client identity for a request.
///
/// `peer_ip` is the socket address of the direct connection. Forwarding
/// headers are consulted in configured order, and only when the peer is
/// in the trusted proxy list. Malformed header values fall back to the
/// peer address rather than failing the request.
pub fn resolve_client_ip(config: &IpConfig, req: &RequestDescriptor, peer_ip: &str) -> IpSource {
    if !is_trusted_proxy(config, peer_ip) {
        return IpSource::DirectConnection {
            ip: peer_ip.to_string(),
        };
    }

    for header in &config.trusted_headers {
        if let Some(value) = req.header(&header.to_ascii_lowercase()) {
            // X-Forwarded-For may carry a chain; the first hop is the
            // original client.
            let candidate = value.split(',').next().unwrap_or("").trim();
            if IpAddr::from_str(candidate).is_ok() {
                return IpSource::TrustedHeader {
                    ip: candidate.to_string(),
                    header: header.clone(),
                };
            }
        }
    }

    IpSource::DirectConnection {
        ip: peer_ip.to_string(),
    }
}

fn is_trusted_proxy(config: &IpConfig, peer_ip: &str) -> bool {
    let Ok(addr) = IpAddr::from_str(peer_ip) else {
        return false;
    };
    config
        .trusted_proxies
        .iter()
        .any(|pattern| matches_ip_or_cidr(&addr, pattern))
}

/// Exact IP match or CIDR containment.
fn matches_ip_or_cidr(ip: &IpAddr, pattern: &str) -> bool {
    if let Some((network, prefix_str)) = pattern.split_once('/') {
        let (Ok(network_ip), Ok(prefix)) = (IpAddr::from_str(network), prefix_str.parse::<u8>())
        else {
            return false;
        };
        match (ip, network_ip) {
            (IpAddr::V4(ip_v4), IpAddr::V4(net_v4)) => {
                if prefix > 32 {
                    return false;
                }
                let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
                (u32::from(*ip_v4) & mask) == (u32::from(net_v4) & mask)
            }
            (IpAddr::V6(ip_v6), IpAddr::V6(net_v6)) => {
                if prefix > 128 {
                    return false;
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - prefix)
                };
                (u128::from(*ip_v6) & mask) == (u128::from(net_v6) & mask)
            }
            _ => false,
        }
    } else {
        pattern == ip.to_string()
    }
}

//! Local address discovery and candidate generation for a /24 sweep.

use super::ScanError;
use ipnetwork::Ipv4Network;
use std::net::{Ipv4Addr, UdpSocket};

/// Any routable address works; no packet is sent to it.
const ROUTE_PROBE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Prefix length of the swept subnet.
pub const SUBNET_PREFIX: u8 = 24;

/// Local IPv4 address of the interface holding the default route.
///
/// Falls back to `127.0.0.1` when there is no route.
pub fn local_ipv4() -> Ipv4Addr {
    match route_source_addr() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::debug!("Could not determine local address: {}", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Connecting a UDP socket only selects a route and a source address.
fn route_source_addr() -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_PROBE_TARGET)?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(ip) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("route source is IPv6 ({})", ip),
        )),
    }
}

/// Local address usable as the base of a sweep, or `SubnetUnresolvable`.
///
/// A loopback or unspecified address means discovery fell back and the LAN
/// is unknown.
pub(crate) fn usable_local(ip: Ipv4Addr) -> Result<Ipv4Addr, ScanError> {
    if ip.is_loopback() || ip.is_unspecified() {
        Err(ScanError::SubnetUnresolvable(format!(
            "local address resolved to {}",
            ip
        )))
    } else {
        Ok(ip)
    }
}

/// The /24 containing `ip`.
pub fn subnet_of(ip: Ipv4Addr) -> Ipv4Network {
    let [a, b, c, _] = ip.octets();
    // A /24 prefix is always valid, the fallback is unreachable.
    Ipv4Network::new(Ipv4Addr::new(a, b, c, 0), SUBNET_PREFIX)
        .unwrap_or_else(|_| Ipv4Network::from(ip))
}

/// Addresses `a.b.c.N` for `N` in `start..=end`, skipping `local` itself.
///
/// `start > end` yields nothing.
pub fn candidates(local: Ipv4Addr, start: u8, end: u8) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();
    (start..=end)
        .map(|n| Ipv4Addr::new(a, b, c, n))
        .filter(|ip| *ip != local)
        .collect()
}

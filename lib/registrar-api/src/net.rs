//! Host identity discovery: hostname and private addresses

use crate::{Result, SpecError};
use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr};

/// RFC 1918 private blocks
const PRIVATE_BLOCKS: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Check whether an address falls inside one of the private blocks
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    PRIVATE_BLOCKS.iter().any(|(base, prefix)| {
        Ipv4Network::new(*base, *prefix)
            .map(|net| net.contains(ip))
            .unwrap_or(false)
    })
}

/// Private IPv4 addresses of the host's non-loopback interfaces, in
/// interface order
pub fn private_ipv4_addrs() -> Result<Vec<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs().map_err(SpecError::Interfaces)?;

    Ok(interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) if is_private_ipv4(ip) => Some(ip),
            _ => None,
        })
        .collect())
}

/// Name of the local host
pub fn local_hostname() -> Result<String> {
    let name = hostname::get().map_err(SpecError::Hostname)?;
    Ok(name.to_string_lossy().into_owned())
}

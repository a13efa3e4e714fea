use crate::error::{DiscoveryError, Result};
use crate::types::NetworkRange;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{ipv4_mask_to_prefix, Ipv4Net};
use std::net::Ipv4Addr;
use tracing::debug;

/// Shortest prefix accepted for a scan. Host lists are built in memory.
pub const MIN_PREFIX_LEN: u8 = 16;

/// A resolved scan range: the network plus its wire-level description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRange {
    pub net: Ipv4Net,
    pub range: NetworkRange,
}

impl ResolvedRange {
    /// Ordered list of host addresses to probe.
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        expand_ipv4net_hosts(self.net)
    }
}

/// Resolve the range to scan.
///
/// With an explicit range, `cidr` is parsed (`a.b.c.d/len`, `a.b.c.d/mask` or a bare
/// address meaning `/32`). Without one, the first non-loopback IPv4 interface is used
/// and its address+netmask determine the network.
pub fn resolve_network_range(cidr: Option<&str>) -> Result<ResolvedRange> {
    let net = match cidr {
        Some(s) => parse_ipv4_cidr(s)?,
        None => detect_primary_network()?,
    };
    ensure_scannable(net)?;
    Ok(describe(net))
}

/// Reject networks wider than [`MIN_PREFIX_LEN`].
pub fn ensure_scannable(net: Ipv4Net) -> Result<()> {
    if net.prefix_len() < MIN_PREFIX_LEN {
        return Err(DiscoveryError::Configuration(format!(
            "network {net} is too large to scan; use a /{MIN_PREFIX_LEN} or narrower range"
        )));
    }
    Ok(())
}

/// Parse a CIDR string into its (truncated) network.
pub fn parse_ipv4_cidr(s: &str) -> Result<Ipv4Net> {
    let s = s.trim();
    let invalid = |why: &str| DiscoveryError::Configuration(format!("invalid CIDR {s:?}: {why}"));

    let (base, prefix) = match s.split_once('/') {
        Some((base, suffix)) => {
            let base: Ipv4Addr = base.trim().parse().map_err(|_| invalid("bad address"))?;
            let suffix = suffix.trim();
            let prefix = if suffix.contains('.') {
                let mask: Ipv4Addr = suffix.parse().map_err(|_| invalid("bad netmask"))?;
                ipv4_mask_to_prefix(mask).map_err(|_| invalid("non-contiguous netmask"))?
            } else {
                suffix.parse::<u8>().map_err(|_| invalid("bad prefix length"))?
            };
            (base, prefix)
        }
        None => (s.parse().map_err(|_| invalid("bad address"))?, 32),
    };

    Ipv4Net::new(base, prefix)
        .map(|n| n.trunc())
        .map_err(|_| invalid("prefix length out of range"))
}

fn detect_primary_network() -> Result<Ipv4Net> {
    let ifaces = get_if_addrs()
        .map_err(|e| DiscoveryError::Configuration(format!("cannot enumerate interfaces: {e}")))?;
    for iface in ifaces {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            let Ok(prefix) = ipv4_mask_to_prefix(v4.netmask) else {
                continue;
            };
            if let Ok(net) = Ipv4Net::new(v4.ip, prefix) {
                debug!(interface = %iface.name, ip = %v4.ip, %net, "selected primary interface");
                return Ok(net.trunc());
            }
        }
    }
    Err(DiscoveryError::Configuration(
        "could not determine local network range: no non-internal IPv4 interface".into(),
    ))
}

/// Build the [`NetworkRange`] description of a network. `total_hosts` is computed here, once.
pub fn describe(net: Ipv4Net) -> ResolvedRange {
    let (first, last) = host_bounds(net);
    let total_hosts = u64::from(u32::from(last)) - u64::from(u32::from(first)) + 1;
    ResolvedRange {
        net,
        range: NetworkRange {
            network: format!("{}/{}", net.network(), net.prefix_len()),
            subnet: net.netmask().to_string(),
            start_ip: first.to_string(),
            end_ip: last.to_string(),
            total_hosts,
        },
    }
}

// /31 and /32 have no separate network/broadcast address, so every address is a host.
fn host_bounds(net: Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        (Ipv4Addr::from(start), Ipv4Addr::from(end))
    } else {
        (Ipv4Addr::from(start + 1), Ipv4Addr::from(end - 1))
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let (first, last) = host_bounds(net);
    (u32::from(first)..=u32::from(last))
        .map(Ipv4Addr::from)
        .collect()
}

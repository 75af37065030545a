use crate::error::{Result, ScanError};
use anyhow::Result as AnyResult;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

/// Cap on how many host addresses one CIDR expands to.
pub const MAX_HOSTS: usize = 254;

/// A validated target specification. Hostnames pass a syntactic check here
/// and resolve once at job setup, so DNS failures surface as job-level
/// errors rather than request rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Addr(IpAddr),
    Hostname(String),
    Network { network: IpNet, hosts: Vec<IpAddr> },
}

impl ResolvedTarget {
    /// The single probeable address for this target, resolving a hostname
    /// at call time. Networks have no single address.
    pub async fn probe_addr(&self) -> Result<IpAddr> {
        match self {
            ResolvedTarget::Addr(ip) => Ok(*ip),
            ResolvedTarget::Hostname(host) => {
                let mut addrs = tokio::net::lookup_host((host.as_str(), 0_u16))
                    .await
                    .map_err(|e| {
                        ScanError::JobStructuralFailure(format!("cannot resolve {host}: {e}"))
                    })?;
                addrs
                    .next()
                    .map(|sa| sa.ip())
                    .ok_or_else(|| {
                        ScanError::JobStructuralFailure(format!("no addresses for {host}"))
                    })
            }
            ResolvedTarget::Network { network, .. } => Err(ScanError::JobStructuralFailure(
                format!("{network} is a network, expected a single host"),
            )),
        }
    }
}

/// Parse a target spec: IP literal, CIDR, or hostname (alnum plus `.`/`-`).
pub fn resolve_target(spec: &str, max_hosts: usize) -> Result<ResolvedTarget> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ScanError::InvalidTarget("empty target".into()));
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(ResolvedTarget::Addr(ip));
    }
    if spec.contains('/') {
        let network: IpNet = spec
            .parse()
            .map_err(|e| ScanError::InvalidTarget(format!("invalid CIDR {spec:?}: {e}")))?;
        let hosts = expand_cidr_hosts(network, max_hosts);
        return Ok(ResolvedTarget::Network { network, hosts });
    }
    if spec.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Ok(ResolvedTarget::Hostname(spec.to_string()));
    }
    Err(ScanError::InvalidTarget(format!(
        "{spec:?} is neither an address, a CIDR, nor a hostname"
    )))
}

/// Parse a CIDR network spec, rejecting plain addresses.
pub fn resolve_network(spec: &str) -> Result<IpNet> {
    spec.trim()
        .parse()
        .map_err(|e| ScanError::InvalidTarget(format!("invalid network {spec:?}: {e}")))
}

/// Expand a CIDR into probeable host addresses, capped at `max`.
///
/// For IPv4, the network and broadcast addresses are excluded. IPv6
/// networks are not enumerated and return an empty list.
pub fn expand_cidr_hosts(cidr: IpNet, max: usize) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .take(max)
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        // Too small to have host addresses
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Detect local non-loopback IPv4 addresses and convert each to a default
/// /24 CIDR network, deduplicated and sorted for stable output.
pub fn detect_local_cidrs() -> AnyResult<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(ip));
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literal_resolves_to_addr() {
        let t = resolve_target("127.0.0.1", MAX_HOSTS).unwrap();
        assert_eq!(t, ResolvedTarget::Addr(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn hostname_accepted_syntactically() {
        let t = resolve_target("db-01.internal.example", MAX_HOSTS).unwrap();
        assert!(matches!(t, ResolvedTarget::Hostname(_)));
    }

    #[test]
    fn garbage_target_rejected() {
        assert!(resolve_target("not a target!", MAX_HOSTS).is_err());
        assert!(resolve_target("", MAX_HOSTS).is_err());
        assert!(resolve_target("10.0.0.0/bad", MAX_HOSTS).is_err());
    }

    #[test]
    fn slash_30_excludes_network_and_broadcast() {
        let t = resolve_target("10.0.0.0/30", MAX_HOSTS).unwrap();
        let ResolvedTarget::Network { hosts, .. } = t else {
            panic!("expected network")
        };
        assert_eq!(
            hosts,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ]
        );
    }

    #[test]
    fn large_network_capped() {
        let t = resolve_target("10.0.0.0/16", MAX_HOSTS).unwrap();
        let ResolvedTarget::Network { hosts, .. } = t else {
            panic!("expected network")
        };
        assert_eq!(hosts.len(), MAX_HOSTS);
    }

    #[test]
    fn default_cidr_from_ipv4() {
        let cidr = ipv4_to_default_cidr(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(cidr.to_string(), "10.1.2.0/24");
    }
}

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};

/// Upper bound on the number of ports in one scan job. Oversized sets are
/// truncated to the lowest-numbered ports and the truncation is reported
/// in the job metadata, never applied silently.
pub const MAX_PORTS: usize = 1000;

/// A resolved, bounded set of ports for one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortSet {
    pub ports: Vec<u16>,
    pub truncated: bool,
}

impl PortSet {
    pub fn from_ports(ports: Vec<u16>) -> Self {
        Self { ports, truncated: false }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Resolve a request's port specification into a concrete set.
///
/// Precedence: explicit list, then `"start-end"` range (clamped to
/// `[1, 65535]`), then the default common-ports list. Duplicates are
/// removed preserving first appearance. Sets larger than `max` keep the
/// lowest-numbered `max` ports with `truncated` set.
pub fn resolve_port_set(explicit: &[u16], range: Option<&str>, max: usize) -> Result<PortSet> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    if !explicit.is_empty() {
        for &p in explicit {
            if p == 0 {
                return Err(ScanError::InvalidPortSpec("port 0 is not probeable".into()));
            }
            if seen.insert(p) {
                out.push(p);
            }
        }
    } else if let Some(spec) = range {
        let (a, b) = spec
            .split_once('-')
            .ok_or_else(|| ScanError::InvalidPortSpec(format!("expected start-end, got {spec:?}")))?;
        // Bounds are clamped into the valid port domain rather than rejected.
        let start = parse_port_bound(a.trim())?.clamp(1, 65535);
        let end = parse_port_bound(b.trim())?.clamp(1, 65535);
        if start > end {
            return Err(ScanError::InvalidPortSpec(format!(
                "invalid range {start}-{end} (start > end)"
            )));
        }
        for p in start..=end {
            out.push(p as u16);
        }
    } else {
        out = default_ports();
    }

    let truncated = out.len() > max;
    if truncated {
        out.sort_unstable();
        out.truncate(max);
    }
    Ok(PortSet { ports: out, truncated })
}

fn parse_port_bound(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| ScanError::InvalidPortSpec(format!("invalid port value: {s:?}")))
}

/// A conservative default list of commonly used TCP ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 993, 995, 1433, 3306, 3389, 5432,
        5900, 8080,
    ];
    DEFAULT.to_vec()
}

/// Common ports probed when a vulnerability scan enumerates services.
pub fn vuln_scan_ports() -> Vec<u16> {
    const PORTS: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 143, 443, 993, 995, 1433, 3306, 3389, 5432,
    ];
    PORTS.to_vec()
}

/// Well-known service label for a port, `"unknown"` otherwise.
pub fn service_label(port: u16) -> &'static str {
    match port {
        21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 => "SMTP",
        53 => "DNS",
        80 => "HTTP",
        110 => "POP3",
        143 => "IMAP",
        443 => "HTTPS",
        993 => "IMAPS",
        995 => "POP3S",
        1433 => "MSSQL",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        5672 => "RabbitMQ",
        6379 => "Redis",
        8080 => "HTTP-Alt",
        8443 => "HTTPS-Alt",
        9200 => "Elasticsearch",
        27017 => "MongoDB",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_list_dedups_preserving_order() {
        let set = resolve_port_set(&[443, 80, 443, 22], None, MAX_PORTS).unwrap();
        assert_eq!(set.ports, vec![443, 80, 22]);
        assert!(!set.truncated);
    }

    #[test]
    fn explicit_port_zero_rejected() {
        let err = resolve_port_set(&[80, 0], None, MAX_PORTS);
        assert!(err.is_err());
    }

    #[test]
    fn range_is_inclusive() {
        let set = resolve_port_set(&[], Some("8000-8002"), MAX_PORTS).unwrap();
        assert_eq!(set.ports, vec![8000, 8001, 8002]);
    }

    #[test]
    fn range_bounds_clamped_to_port_domain() {
        let set = resolve_port_set(&[], Some("65530-70000"), MAX_PORTS).unwrap();
        assert_eq!(set.ports, vec![65530, 65531, 65532, 65533, 65534, 65535]);
        let set = resolve_port_set(&[], Some("0-3"), MAX_PORTS).unwrap();
        assert_eq!(set.ports, vec![1, 2, 3]);
    }

    #[test]
    fn backwards_range_rejected() {
        assert!(resolve_port_set(&[], Some("100-10"), MAX_PORTS).is_err());
    }

    #[test]
    fn oversized_range_truncated_to_lowest_and_reported() {
        let set = resolve_port_set(&[], Some("1-2000"), 1000).unwrap();
        assert_eq!(set.ports.len(), 1000);
        assert_eq!(set.ports.first(), Some(&1));
        assert_eq!(set.ports.last(), Some(&1000));
        assert!(set.truncated);
    }

    #[test]
    fn empty_spec_uses_defaults() {
        let set = resolve_port_set(&[], None, MAX_PORTS).unwrap();
        assert_eq!(set.ports, default_ports());
        assert!(!set.truncated);
    }

    #[test]
    fn service_labels() {
        assert_eq!(service_label(22), "SSH");
        assert_eq!(service_label(3389), "RDP");
        assert_eq!(service_label(9999), "unknown");
    }
}

use crate::types::{Finding, ProbeResult, Severity};
use async_trait::async_trait;
use std::time::Duration;

/// Ports that get a follow-up HTTP header check on deeper scans.
pub const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443];

/// Derive findings from the open ports of a completed scan. Pure:
/// static port table plus banner substring matches.
pub fn evaluate(open_ports: &[ProbeResult]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for probe in open_ports {
        port_findings(probe, &mut findings);
        if let Some(banner) = &probe.banner {
            banner_findings(probe, banner, &mut findings);
        }
    }
    findings
}

fn port_findings(probe: &ProbeResult, out: &mut Vec<Finding>) {
    let known: &[(&str, &str)] = match probe.port {
        21 => &[
            ("anonymous_login", "Anonymous FTP access may be enabled"),
            ("weak_encryption", "FTP transmits data in plaintext"),
        ],
        23 => &[
            ("plaintext_protocol", "Telnet transmits credentials in plaintext"),
            ("weak_authentication", "Telnet lacks strong authentication mechanisms"),
        ],
        80 => &[
            ("unencrypted_web", "Web service not using HTTPS encryption"),
            ("information_disclosure", "Server banner may reveal version information"),
        ],
        3389 => &[
            ("rdp_exposed", "RDP service exposed to the network"),
            ("brute_force_risk", "RDP vulnerable to brute force attacks"),
        ],
        _ => &[],
    };
    for (id, description) in known {
        out.push(Finding {
            id: (*id).to_string(),
            port: probe.port,
            service: probe.service.clone(),
            severity: Severity::Medium,
            description: (*description).to_string(),
            recommendation: format!("Secure or disable the {} service", probe.service),
        });
    }
}

fn banner_findings(probe: &ProbeResult, banner: &str, out: &mut Vec<Finding>) {
    if banner.contains("SSH-1.") {
        out.push(Finding {
            id: "ssh_v1".to_string(),
            port: probe.port,
            service: probe.service.clone(),
            severity: Severity::High,
            description: "SSH version 1.x detected (deprecated)".to_string(),
            recommendation: "Upgrade to SSH version 2.x".to_string(),
        });
    }
}

/// Weighted risk score in `[0, 100]`: sum of severity weights normalized
/// by the maximum possible (`count * 10`). Empty input scores 0.
pub fn risk_score(findings: &[Finding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    let total: u32 = findings.iter().map(|f| f.severity.weight()).sum();
    let max_possible = (findings.len() * 10) as f64;
    (f64::from(total) / max_possible * 100.0).min(100.0)
}

/// Band a score into a level. Bands are inclusive at their lower bound.
pub fn risk_level(score: f64) -> &'static str {
    if score >= 80.0 {
        "critical"
    } else if score >= 60.0 {
        "high"
    } else if score >= 40.0 {
        "medium"
    } else if score >= 20.0 {
        "low"
    } else {
        "minimal"
    }
}

/// Secondary HTTP probe for header-based findings on detected web ports.
/// Implemented outside the scan core; injected so tests never hit the
/// network.
#[async_trait]
pub trait HeaderProbe: Send + Sync {
    async fn check(&self, target: &str, port: u16) -> anyhow::Result<Vec<Finding>>;
}

/// External reputation/geolocation lookup. A single fallible
/// request/response call; failures degrade the report to partial data.
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    async fn lookup(&self, target: &str) -> anyhow::Result<serde_json::Value>;
}

/// reqwest-backed [`HeaderProbe`] flagging missing security headers and
/// outdated server banners.
pub struct HttpHeaderProbe {
    client: reqwest::Client,
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Frame-Options", "Clickjacking protection missing"),
    ("X-Content-Type-Options", "MIME type sniffing protection missing"),
    ("X-XSS-Protection", "XSS protection header missing"),
    ("Strict-Transport-Security", "HSTS header missing (HTTPS only)"),
    ("Content-Security-Policy", "CSP header missing"),
];

const OUTDATED_SERVERS: &[&str] = &["apache/2.2", "nginx/1.0", "iis/6.0"];

impl HttpHeaderProbe {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HeaderProbe for HttpHeaderProbe {
    async fn check(&self, target: &str, port: u16) -> anyhow::Result<Vec<Finding>> {
        let scheme = if port == 443 || port == 8443 { "https" } else { "http" };
        let url = format!("{scheme}://{target}:{port}/");
        let response = self.client.get(&url).send().await?;
        let headers = response.headers();

        let mut findings = Vec::new();
        for (header, description) in SECURITY_HEADERS {
            if *header == "Strict-Transport-Security" && scheme == "http" {
                continue;
            }
            if !headers.contains_key(*header) {
                findings.push(Finding {
                    id: format!("missing_{}", header.to_lowercase().replace('-', "_")),
                    port,
                    service: "HTTP/HTTPS".to_string(),
                    severity: Severity::Low,
                    description: (*description).to_string(),
                    recommendation: format!("Add {header} security header"),
                });
            }
        }

        if let Some(server) = headers.get("Server").and_then(|v| v.to_str().ok()) {
            let lowered = server.to_lowercase();
            if OUTDATED_SERVERS.iter().any(|s| lowered.contains(s)) {
                findings.push(Finding {
                    id: "outdated_server".to_string(),
                    port,
                    service: "HTTP/HTTPS".to_string(),
                    severity: Severity::Medium,
                    description: format!("Potentially outdated server version: {server}"),
                    recommendation: "Update web server to latest version".to_string(),
                });
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortOutcome;

    fn open(port: u16, banner: Option<&str>) -> ProbeResult {
        ProbeResult {
            port,
            outcome: PortOutcome::Open,
            service: crate::ports::service_label(port).to_string(),
            banner: banner.map(str::to_string),
            latency_ms: 1,
        }
    }

    fn finding(severity: Severity) -> Finding {
        Finding {
            id: "x".into(),
            port: 80,
            service: "HTTP".into(),
            severity,
            description: String::new(),
            recommendation: String::new(),
        }
    }

    #[test]
    fn telnet_yields_plaintext_findings() {
        let findings = evaluate(&[open(23, None)]);
        assert!(findings.iter().any(|f| f.id == "plaintext_protocol"));
        assert!(findings.iter().any(|f| f.id == "weak_authentication"));
    }

    #[test]
    fn ssh1_banner_yields_high_severity_finding() {
        let findings = evaluate(&[open(22, Some("SSH-1.99-OpenSSH_2.9"))]);
        let ssh = findings.iter().find(|f| f.id == "ssh_v1").expect("ssh_v1");
        assert_eq!(ssh.severity, Severity::High);
    }

    #[test]
    fn no_open_ports_no_findings() {
        assert!(evaluate(&[]).is_empty());
    }

    #[test]
    fn risk_score_empty_is_zero() {
        assert_eq!(risk_score(&[]), 0.0);
    }

    #[test]
    fn risk_score_monotone_under_equal_or_higher_severity() {
        let base = vec![finding(Severity::Medium)];
        let more = vec![finding(Severity::Medium), finding(Severity::High)];
        let even_more = vec![
            finding(Severity::Medium),
            finding(Severity::High),
            finding(Severity::Critical),
        ];
        let a = risk_score(&base);
        let b = risk_score(&more);
        let c = risk_score(&even_more);
        assert!(b >= a);
        assert!(c >= b);
    }

    #[test]
    fn risk_score_all_critical_is_100() {
        let findings = vec![finding(Severity::Critical), finding(Severity::Critical)];
        assert_eq!(risk_score(&findings), 100.0);
    }

    #[test]
    fn risk_level_bands_inclusive_at_lower_bound() {
        assert_eq!(risk_level(39.9), "low");
        assert_eq!(risk_level(40.0), "medium");
        assert_eq!(risk_level(59.9), "medium");
        assert_eq!(risk_level(60.0), "high");
        assert_eq!(risk_level(80.0), "critical");
        assert_eq!(risk_level(19.9), "minimal");
        assert_eq!(risk_level(20.0), "low");
        assert_eq!(risk_level(0.0), "minimal");
    }
}

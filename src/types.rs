use serde::{Deserialize, Serialize};
use time::{format_description::well_known, OffsetDateTime};
use uuid::Uuid;

/// Three-way classification of a single TCP probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortOutcome {
    /// Connection accepted.
    Open,
    /// Connection actively refused.
    Closed,
    /// Timeout or any other I/O error.
    Filtered,
}

/// Result of one probe against one (host, port) pair. Immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub port: u16,
    pub outcome: PortOutcome,
    pub service: String,
    pub banner: Option<String>,
    pub latency_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn weight(self) -> u32 {
        match self {
            Severity::Critical => 10,
            Severity::High => 7,
            Severity::Medium => 4,
            Severity::Low => 1,
        }
    }
}

/// A derived vulnerability heuristic match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub id: String,
    pub port: u16,
    pub service: String,
    pub severity: Severity,
    pub description: String,
    pub recommendation: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    PortScan,
    Discovery,
    Vulnerability,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregated outcome of a port scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortScanReport {
    pub target: String,
    pub total_ports: usize,
    pub open_ports: Vec<ProbeResult>,
    pub closed_count: usize,
    pub filtered_count: usize,
    /// True when the requested port set exceeded the limit and was cut
    /// down to the lowest-numbered ports.
    pub truncated_ports: bool,
}

/// One host found active during network discovery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActiveHost {
    pub ip: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    pub network: String,
    pub method: String,
    pub hosts_scanned: usize,
    pub active_hosts: Vec<ActiveHost>,
    pub active_count: usize,
}

/// Service detected on an open port; the input unit for heuristics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub port: u16,
    pub service: String,
    pub banner: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VulnReport {
    pub target: String,
    pub depth: String,
    pub services: Vec<ServiceInfo>,
    pub findings: Vec<Finding>,
    pub finding_count: usize,
    pub risk_score: f64,
    pub risk_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<serde_json::Value>,
    /// Set when an external collaborator lookup failed; never fatal.
    pub partial_data: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ScanReport {
    PortScan(PortScanReport),
    Discovery(DiscoveryReport),
    Vulnerability(VulnReport),
}

/// A scan job as tracked by the scheduler and the result store. Mutated
/// only by the scheduler that owns it; everyone else sees clones.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanJob {
    pub id: Uuid,
    pub target: String,
    pub kind: ScanKind,
    pub status: JobStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub result: Option<ScanReport>,
    pub error: Option<String>,
}

impl ScanJob {
    pub fn new(id: Uuid, kind: ScanKind, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
            kind,
            status: JobStatus::Running,
            started_at: now_rfc3339(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn complete(&mut self, report: ScanReport) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now_rfc3339());
        self.result = Some(report);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(now_rfc3339());
        self.error = Some(error.into());
    }
}

/// RFC3339 UTC timestamp for wire events and job bookkeeping.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

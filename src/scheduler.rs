use crate::error::{Result, ScanError};
use crate::heuristics::{self, HeaderProbe, ReputationLookup, WEB_PORTS};
use crate::ports::{self, PortSet, MAX_PORTS};
use crate::prober::Prober;
use crate::protocol::{Event, RealtimeKind, RealtimeScanConfig};
use crate::registry::ConnectionHub;
use crate::store::ResultStore;
use crate::targets::{self, ResolvedTarget, MAX_HOSTS};
use crate::types::{
    ActiveHost, DiscoveryReport, PortOutcome, PortScanReport, ProbeResult, ScanJob, ScanKind,
    ScanReport, ServiceInfo, VulnReport,
};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

/// Default concurrency cap for port-scan probes.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 50;
/// Default concurrency cap for host discovery.
pub const DEFAULT_DISCOVERY_CONCURRENCY: usize = 20;
/// Emit a progress event every this many completed units.
const PROGRESS_EVERY: usize = 10;
/// Ports tried when discovering hosts over TCP.
const DISCOVERY_PROBE_PORTS: &[u16] = &[22, 80, 443, 135, 139, 445];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    #[default]
    Ping,
    Tcp,
}

impl DiscoveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMethod::Ping => "ping",
            DiscoveryMethod::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanDepth {
    #[default]
    Basic,
    Intermediate,
    Deep,
}

impl ScanDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanDepth::Basic => "basic",
            ScanDepth::Intermediate => "intermediate",
            ScanDepth::Deep => "deep",
        }
    }
}

/// Drives scan jobs: bounded-concurrency probe execution, result
/// aggregation, progress fan-out, and job store bookkeeping. Each job's
/// probes run under their own semaphore, so one job cannot starve another.
pub struct Scheduler {
    store: Arc<dyn ResultStore>,
    hub: Arc<ConnectionHub>,
    prober: Arc<dyn Prober>,
    header_probe: Option<Arc<dyn HeaderProbe>>,
    reputation: Option<Arc<dyn ReputationLookup>>,
    /// In-flight background jobs, enumerable for stats and shutdown.
    active: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ResultStore>,
        hub: Arc<ConnectionHub>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            store,
            hub,
            prober,
            header_probe: None,
            reputation: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_header_probe(mut self, probe: Arc<dyn HeaderProbe>) -> Self {
        self.header_probe = Some(probe);
        self
    }

    pub fn with_reputation(mut self, lookup: Arc<dyn ReputationLookup>) -> Self {
        self.reputation = Some(lookup);
        self
    }

    /// Ids of background jobs currently in flight.
    pub async fn active_jobs(&self) -> Vec<Uuid> {
        self.active.lock().await.keys().copied().collect()
    }

    /// Run a port scan end to end: validate, create the job, probe, and
    /// record the terminal state. Validation failures reject the request
    /// before any job exists; a hostname that fails to resolve marks the
    /// job `failed`.
    pub async fn port_scan_job(
        &self,
        scan_id: Uuid,
        target: &str,
        explicit_ports: &[u16],
        port_range: Option<&str>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Result<ScanJob> {
        let resolved = resolve_single_host(target)?;
        let set = ports::resolve_port_set(explicit_ports, port_range, MAX_PORTS)?;

        let mut job = ScanJob::new(scan_id, ScanKind::PortScan, target);
        self.store.put(job.clone()).await;
        info!(%scan_id, host = target, ports = set.len(), "starting port scan");

        match self.scan_ports(scan_id, target, &resolved, &set, timeout, max_concurrency).await {
            Ok(report) => {
                job.complete(ScanReport::PortScan(report.clone()));
                self.hub
                    .publish(scan_id, &Event::scan_completed(scan_id, ScanReport::PortScan(report)))
                    .await;
            }
            Err(e) => {
                warn!(%scan_id, error = %e, "port scan failed");
                job.fail(e.to_string());
                self.hub.publish(scan_id, &Event::scan_error(scan_id, e.to_string())).await;
            }
        }
        self.store.put(job.clone()).await;
        Ok(job)
    }

    async fn scan_ports(
        &self,
        scan_id: Uuid,
        target: &str,
        resolved: &ResolvedTarget,
        set: &PortSet,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Result<PortScanReport> {
        let addr = resolved.probe_addr().await?;
        let results = self
            .probe_all(scan_id, addr, set.ports.clone(), timeout, max_concurrency)
            .await;

        let mut open_ports: Vec<ProbeResult> = results
            .iter()
            .filter(|r| r.outcome == PortOutcome::Open)
            .cloned()
            .collect();
        open_ports.sort_by_key(|r| r.port);
        let closed_count = results.iter().filter(|r| r.outcome == PortOutcome::Closed).count();
        let filtered_count = results.iter().filter(|r| r.outcome == PortOutcome::Filtered).count();

        Ok(PortScanReport {
            target: target.to_string(),
            total_ports: set.len(),
            open_ports,
            closed_count,
            filtered_count,
            truncated_ports: set.truncated,
        })
    }

    /// Probe every port under this job's own concurrency cap.
    ///
    /// Workers send each result into a channel drained by this (single)
    /// aggregation loop, which owns all counters and publishes events.
    /// Sequential emission is what makes the progress percentage
    /// monotone and `port_found` immediate.
    async fn probe_all(
        &self,
        scan_id: Uuid,
        addr: IpAddr,
        ports: Vec<u16>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Vec<ProbeResult> {
        let total = ports.len();
        if total == 0 {
            return Vec::new();
        }

        let sem = Arc::new(Semaphore::new(max_concurrency.clamp(1, 5_000)));
        let (tx, mut rx) = mpsc::unbounded_channel::<ProbeResult>();
        let prober = self.prober.clone();

        let spawner = tokio::spawn(async move {
            let mut set = JoinSet::new();
            for port in ports {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore in scope");
                let tx = tx.clone();
                let prober = prober.clone();
                set.spawn(async move {
                    let _permit = permit; // keep permit until probe completes
                    let result = prober.probe(addr, port, timeout).await;
                    let _ = tx.send(result);
                });
            }
            drop(tx);
            while set.join_next().await.is_some() {}
        });

        self.hub.publish(scan_id, &Event::scan_progress(scan_id, 0, total, 0)).await;

        let mut results = Vec::with_capacity(total);
        let mut found = 0usize;
        while let Some(result) = rx.recv().await {
            if result.outcome == PortOutcome::Open {
                found += 1;
                self.hub
                    .publish(
                        scan_id,
                        &Event::port_found(scan_id, result.port, result.service.clone()),
                    )
                    .await;
            }
            results.push(result);
            let scanned = results.len();
            if scanned % PROGRESS_EVERY == 0 || scanned == total {
                self.hub
                    .publish(scan_id, &Event::scan_progress(scan_id, scanned, total, found))
                    .await;
            }
        }
        let _ = spawner.await;
        results
    }

    /// Discover active hosts in a network. The network spec is validated
    /// before the job exists; an empty host list is a completed scan with
    /// no findings, not an error.
    pub async fn discovery_job(
        &self,
        scan_id: Uuid,
        network: &str,
        method: DiscoveryMethod,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Result<ScanJob> {
        let net = targets::resolve_network(network)?;

        let mut job = ScanJob::new(scan_id, ScanKind::Discovery, network);
        self.store.put(job.clone()).await;
        info!(%scan_id, network, method = method.as_str(), "starting discovery");

        let report = self.discover(scan_id, net, method, timeout, max_concurrency).await;
        job.complete(ScanReport::Discovery(report.clone()));
        self.hub
            .publish(scan_id, &Event::scan_completed(scan_id, ScanReport::Discovery(report)))
            .await;
        self.store.put(job.clone()).await;
        Ok(job)
    }

    async fn discover(
        &self,
        scan_id: Uuid,
        net: IpNet,
        method: DiscoveryMethod,
        timeout: Duration,
        max_concurrency: usize,
    ) -> DiscoveryReport {
        let hosts = targets::expand_cidr_hosts(net, MAX_HOSTS);
        let total = hosts.len();

        let sem = Arc::new(Semaphore::new(max_concurrency.clamp(1, 5_000)));
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<ActiveHost>>();
        let prober = self.prober.clone();

        let spawner = tokio::spawn(async move {
            let mut set = JoinSet::new();
            for ip in hosts {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore in scope");
                let tx = tx.clone();
                let prober = prober.clone();
                set.spawn(async move {
                    let _permit = permit;
                    let active = discover_host(prober.as_ref(), ip, method, timeout).await;
                    let _ = tx.send(active);
                });
            }
            drop(tx);
            while set.join_next().await.is_some() {}
        });

        if total > 0 {
            self.hub.publish(scan_id, &Event::scan_progress(scan_id, 0, total, 0)).await;
        }

        let mut active_hosts = Vec::new();
        let mut scanned = 0usize;
        while let Some(outcome) = rx.recv().await {
            scanned += 1;
            if let Some(host) = outcome {
                self.hub
                    .publish(
                        scan_id,
                        &Event::host_found(scan_id, host.ip.clone(), host.method.clone()),
                    )
                    .await;
                active_hosts.push(host);
            }
            if scanned % PROGRESS_EVERY == 0 || scanned == total {
                self.hub
                    .publish(
                        scan_id,
                        &Event::scan_progress(scan_id, scanned, total, active_hosts.len()),
                    )
                    .await;
            }
        }
        let _ = spawner.await;

        active_hosts.sort_by(|a, b| a.ip.cmp(&b.ip));
        DiscoveryReport {
            network: net.to_string(),
            method: method.as_str().to_string(),
            hosts_scanned: total,
            active_count: active_hosts.len(),
            active_hosts,
        }
    }

    /// Vulnerability assessment: enumerate services over the common ports,
    /// derive findings, and score the result. Deeper depths add web header
    /// checks and a reputation lookup; collaborator failures degrade to
    /// partial data, never fail the scan.
    pub async fn vulnerability_job(
        &self,
        scan_id: Uuid,
        target: &str,
        depth: ScanDepth,
    ) -> Result<ScanJob> {
        let resolved = resolve_single_host(target)?;

        let mut job = ScanJob::new(scan_id, ScanKind::Vulnerability, target);
        self.store.put(job.clone()).await;
        info!(%scan_id, host = target, depth = depth.as_str(), "starting vulnerability scan");

        let set = PortSet::from_ports(ports::vuln_scan_ports());
        match self
            .scan_ports(scan_id, target, &resolved, &set, Duration::from_secs(2), DEFAULT_SCAN_CONCURRENCY)
            .await
        {
            Ok(port_report) => {
                let report = self.assess(target, depth, &port_report).await;
                job.complete(ScanReport::Vulnerability(report.clone()));
                self.hub
                    .publish(
                        scan_id,
                        &Event::scan_completed(scan_id, ScanReport::Vulnerability(report)),
                    )
                    .await;
            }
            Err(e) => {
                warn!(%scan_id, error = %e, "vulnerability scan failed");
                job.fail(e.to_string());
                self.hub.publish(scan_id, &Event::scan_error(scan_id, e.to_string())).await;
            }
        }
        self.store.put(job.clone()).await;
        Ok(job)
    }

    async fn assess(&self, target: &str, depth: ScanDepth, ports: &PortScanReport) -> VulnReport {
        let services: Vec<ServiceInfo> = ports
            .open_ports
            .iter()
            .map(|p| ServiceInfo {
                port: p.port,
                service: p.service.clone(),
                banner: p.banner.clone(),
            })
            .collect();

        let mut findings = heuristics::evaluate(&ports.open_ports);
        let mut partial_data = false;

        if depth != ScanDepth::Basic {
            if let Some(probe) = &self.header_probe {
                let web_ports = ports
                    .open_ports
                    .iter()
                    .filter(|p| WEB_PORTS.contains(&p.port));
                for p in web_ports {
                    match probe.check(target, p.port).await {
                        Ok(more) => findings.extend(more),
                        Err(e) => {
                            warn!(host = target, port = p.port, error = %e, "header probe failed");
                            partial_data = true;
                        }
                    }
                }
            }
        }

        let mut reputation = None;
        if depth == ScanDepth::Deep {
            if let Some(lookup) = &self.reputation {
                match lookup.lookup(target).await {
                    Ok(data) => reputation = Some(data),
                    Err(e) => {
                        warn!(host = target, error = %e, "reputation lookup failed");
                        partial_data = true;
                    }
                }
            }
        }

        let risk_score = heuristics::risk_score(&findings);
        VulnReport {
            target: target.to_string(),
            depth: depth.as_str().to_string(),
            services,
            finding_count: findings.len(),
            risk_score,
            risk_level: heuristics::risk_level(risk_score).to_string(),
            findings,
            reputation,
            partial_data,
        }
    }

    /// Schedule a client-requested scan without blocking the session that
    /// asked for it. The task is registered in the supervised `active` map
    /// and removes itself on completion; failures reach subscribers as a
    /// `scan_error` event.
    pub async fn spawn_realtime(self: &Arc<Self>, scan_id: Uuid, config: RealtimeScanConfig) {
        let sched = self.clone();
        // Holding the map lock across the spawn means the task's own
        // cleanup cannot run before its handle is inserted.
        let mut active = self.active.lock().await;
        let handle = tokio::spawn(async move {
            let timeout = Duration::from_secs(config.timeout_secs.max(1));
            let outcome = match config.kind {
                RealtimeKind::PortScan => {
                    sched
                        .port_scan_job(
                            scan_id,
                            &config.target,
                            &config.ports,
                            config.port_range.as_deref(),
                            timeout,
                            config.max_concurrency.unwrap_or(DEFAULT_SCAN_CONCURRENCY),
                        )
                        .await
                }
                RealtimeKind::NetworkDiscovery => {
                    sched
                        .discovery_job(
                            scan_id,
                            &config.target,
                            DiscoveryMethod::default(),
                            timeout,
                            config.max_concurrency.unwrap_or(DEFAULT_DISCOVERY_CONCURRENCY),
                        )
                        .await
                }
            };
            if let Err(e) = outcome {
                // Validation failure: no job was created, but subscribers
                // still get a terminal event.
                sched
                    .hub
                    .publish(scan_id, &Event::scan_error(scan_id, e.to_string()))
                    .await;
            }
            sched.active.lock().await.remove(&scan_id);
        });
        active.insert(scan_id, handle);
    }
}

/// Port and vulnerability scans address one host; a CIDR is rejected up
/// front rather than silently scanning its first address.
fn resolve_single_host(target: &str) -> Result<ResolvedTarget> {
    match targets::resolve_target(target, MAX_HOSTS)? {
        ResolvedTarget::Network { network, .. } => Err(ScanError::InvalidTarget(format!(
            "{network} is a network; use discovery for CIDR targets"
        ))),
        other => Ok(other),
    }
}

/// Check one host for liveness. `ping` shells out to the system binary
/// since raw ICMP sockets need privileges; `tcp` tries the common ports
/// until one accepts.
async fn discover_host(
    prober: &dyn Prober,
    ip: IpAddr,
    method: DiscoveryMethod,
    timeout: Duration,
) -> Option<ActiveHost> {
    match method {
        DiscoveryMethod::Ping => {
            let secs = timeout.as_secs().max(1);
            let output = tokio::process::Command::new("ping")
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg(secs.to_string())
                .arg(ip.to_string())
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => Some(ActiveHost {
                    ip: ip.to_string(),
                    method: "ping".to_string(),
                    open_port: None,
                }),
                _ => None,
            }
        }
        DiscoveryMethod::Tcp => {
            for &port in DISCOVERY_PROBE_PORTS {
                let result = prober.probe(ip, port, timeout).await;
                if result.outcome == PortOutcome::Open {
                    return Some(ActiveHost {
                        ip: ip.to_string(),
                        method: format!("tcp:{port}"),
                        open_port: Some(port),
                    });
                }
            }
            None
        }
    }
}

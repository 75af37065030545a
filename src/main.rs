use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use uuid::Uuid;

use netrecon_rs::heuristics::HttpHeaderProbe;
use netrecon_rs::prober::TcpProber;
use netrecon_rs::registry::ConnectionHub;
use netrecon_rs::scheduler::{Scheduler, DEFAULT_SCAN_CONCURRENCY};
use netrecon_rs::server::{self, AppState};
use netrecon_rs::store::{MemoryStore, ResultStore};
use netrecon_rs::targets;
use netrecon_rs::types::{ScanJob, ScanReport};

/// netrecon-rs — Async network recon: bounded TCP scanning with real-time
/// WebSocket progress streaming.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "netrecon-rs",
    version,
    about = "Async network recon service with real-time progress streaming.",
    long_about = None
)]
struct Cli {
    /// Run the REST+WebSocket API server.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Bind address for the API server.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// One-shot port scan of this target (IP or hostname), then exit.
    #[arg(long)]
    scan: Option<String>,

    /// Explicit ports for --scan (comma separated).
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,

    /// Port range for --scan, e.g. 1-1024.
    #[arg(long)]
    port_range: Option<String>,

    /// Max concurrent probe attempts.
    #[arg(long, default_value_t = DEFAULT_SCAN_CONCURRENCY)]
    concurrency: usize,

    /// Per-probe connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,

    /// Write the scan job as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
    let hub = Arc::new(ConnectionHub::new());
    let mut scheduler = Scheduler::new(store.clone(), hub.clone(), Arc::new(TcpProber::default()));
    if let Ok(probe) = HttpHeaderProbe::new() {
        scheduler = scheduler.with_header_probe(Arc::new(probe));
    }
    let scheduler = Arc::new(scheduler);
    let state = AppState { hub, scheduler: scheduler.clone(), store };

    if let Some(target) = cli.scan.as_deref() {
        let job = scheduler
            .port_scan_job(
                Uuid::new_v4(),
                target,
                &cli.ports,
                cli.port_range.as_deref(),
                Duration::from_millis(cli.timeout_ms),
                cli.concurrency,
            )
            .await?;
        print_job(&job);
        if let Some(path) = cli.output.as_deref() {
            write_job_json(path, &job)?;
            println!("Wrote JSON results to {}", path.display());
        }
        return Ok(());
    }

    if cli.serve {
        println!("netrecon-rs API on http://{} (Ctrl+C to stop)", cli.bind);
        server::serve(&cli.bind, state).await?;
        return Ok(());
    }

    // No mode selected: show what a discovery scan would cover.
    match targets::detect_local_cidrs() {
        Ok(cidrs) => {
            println!("Detected local IPv4 CIDRs:");
            let mut total = 0usize;
            for cidr in &cidrs {
                let hosts = targets::expand_cidr_hosts(*cidr, targets::MAX_HOSTS);
                total += hosts.len();
                println!("  - {} ({} hosts)", cidr, hosts.len());
            }
            println!("Total candidate hosts (capped per network): {total}");
            println!("Run with --serve for the API, or --scan <target> for a one-shot scan.");
        }
        Err(e) => eprintln!("Warning: failed to detect local networks: {e}"),
    }
    Ok(())
}

fn print_job(job: &ScanJob) {
    let Some(ScanReport::PortScan(report)) = &job.result else {
        println!("scan {} finished with status {:?}", job.id, job.status);
        if let Some(err) = &job.error {
            println!("error: {err}");
        }
        return;
    };

    println!(
        "\nScan {} of {}: {} open / {} closed / {} filtered (of {})",
        job.id,
        report.target,
        report.open_ports.len(),
        report.closed_count,
        report.filtered_count,
        report.total_ports
    );
    if report.truncated_ports {
        println!("note: requested port set was truncated to the lowest {} ports", report.total_ports);
    }

    let mut banner_w = "banner".len();
    for e in &report.open_ports {
        if let Some(b) = &e.banner {
            banner_w = banner_w.max(b.len().min(60));
        }
    }
    println!("{:>5}  {:<12}  {:>10}  {:<banner_w$}", "port", "service", "latency_ms", "banner");
    println!("{:-<5}  {:-<12}  {:-<10}  {:-<banner_w$}", "", "", "", "");
    for e in &report.open_ports {
        let mut banner = e.banner.clone().unwrap_or_default();
        if banner.len() > 60 {
            banner.truncate(60);
        }
        println!(
            "{:>5}  {:<12}  {:>10}  {:<banner_w$}",
            e.port, e.service, e.latency_ms, banner
        );
    }
}

fn write_job_json(path: &std::path::Path, job: &ScanJob) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, job)?;
    Ok(())
}

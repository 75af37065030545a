use crate::ports::service_label;
use crate::types::{PortOutcome, ProbeResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

/// Maximum bytes read when grabbing a banner.
const BANNER_READ_LIMIT: usize = 256;
/// Maximum characters kept from a sanitized banner.
const BANNER_MAX_CHARS: usize = 100;

/// The atomic unit of scan work. A seam so the scheduler can be exercised
/// with fakes that never touch the network.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: IpAddr, port: u16, timeout: Duration) -> ProbeResult;
}

/// TCP connect prober with an optional banner grab.
///
/// `banner_probe` is written to the socket before reading; some services
/// only talk when spoken to, but the bytes can be mildly intrusive to
/// strict protocols, so the payload is configurable and `None` yields a
/// purely passive read.
pub struct TcpProber {
    pub banner_probe: Option<Vec<u8>>,
    pub banner_read_timeout: Duration,
}

impl Default for TcpProber {
    fn default() -> Self {
        Self {
            banner_probe: Some(b"\r\n".to_vec()),
            banner_read_timeout: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: IpAddr, port: u16, timeout: Duration) -> ProbeResult {
        let sock = SocketAddr::new(addr, port);
        let start = Instant::now();
        let outcome;
        let mut banner = None;
        match time::timeout(timeout, TcpStream::connect(sock)).await {
            Ok(Ok(mut stream)) => {
                outcome = PortOutcome::Open;
                banner = self.read_banner(&mut stream).await;
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                outcome = PortOutcome::Closed;
            }
            // Timeout or any other I/O error.
            _ => outcome = PortOutcome::Filtered,
        }
        ProbeResult {
            port,
            outcome,
            service: service_label(port).to_string(),
            banner,
            latency_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl TcpProber {
    /// Passive variant that never writes to the remote service.
    pub fn passive() -> Self {
        Self { banner_probe: None, ..Self::default() }
    }

    async fn read_banner(&self, stream: &mut TcpStream) -> Option<String> {
        if let Some(payload) = &self.banner_probe {
            // A write failure just means no banner; the port is still open.
            let _ = stream.write_all(payload).await;
        }
        let mut buf = vec![0u8; BANNER_READ_LIMIT];
        match time::timeout(self.banner_read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => sanitize_banner(&buf[..n]),
            _ => None,
        }
    }
}

/// Strip non-printable bytes and bound the banner length.
pub(crate) fn sanitize_banner(raw: &[u8]) -> Option<String> {
    let text: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !c.is_control())
        .take(BANNER_MAX_CHARS)
        .collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

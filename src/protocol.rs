use crate::registry::HubStats;
use crate::types::{now_rfc3339, ScanKind, ScanReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound client messages. A closed set: anything else is answered with
/// an error event and the session stays open.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Ping,
    SubscribeScan { scan_id: Uuid },
    UnsubscribeScan { scan_id: Uuid },
    GetStats,
    StartRealtimeScan { config: RealtimeScanConfig },
}

const KNOWN_TYPES: &[&str] = &[
    "ping",
    "subscribe_scan",
    "unsubscribe_scan",
    "get_stats",
    "start_realtime_scan",
];

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RealtimeScanConfig {
    #[serde(rename = "type", default)]
    pub kind: RealtimeKind,
    pub target: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub port_range: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeKind {
    #[default]
    PortScan,
    NetworkDiscovery,
}

impl From<RealtimeKind> for ScanKind {
    fn from(kind: RealtimeKind) -> Self {
        match kind {
            RealtimeKind::PortScan => ScanKind::PortScan,
            RealtimeKind::NetworkDiscovery => ScanKind::Discovery,
        }
    }
}

fn default_timeout_secs() -> u64 {
    3
}

/// Why an inbound message was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Well-formed JSON with an unrecognized `type`.
    UnknownType(String),
    /// Not JSON, missing `type`, or a bad payload for a known type.
    Malformed(String),
}

/// Decode one inbound text frame into a command, distinguishing unknown
/// message types from malformed payloads so each degrades gracefully.
pub fn decode_command(text: &str) -> Result<ClientCommand, CommandError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommandError::Malformed("missing \"type\" field".to_string()))?
        .to_string();
    match serde_json::from_value::<ClientCommand>(value) {
        Ok(cmd) => Ok(cmd),
        Err(e) if KNOWN_TYPES.contains(&kind.as_str()) => {
            Err(CommandError::Malformed(e.to_string()))
        }
        Err(_) => Err(CommandError::UnknownType(kind)),
    }
}

/// Outbound events. Every variant carries an RFC3339 timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ConnectionEstablished {
        client_id: Uuid,
        message: String,
        timestamp: String,
    },
    Pong {
        client_id: Uuid,
        timestamp: String,
    },
    SubscriptionConfirmed {
        scan_id: Uuid,
        message: String,
        timestamp: String,
    },
    UnsubscriptionConfirmed {
        scan_id: Uuid,
        message: String,
        timestamp: String,
    },
    StatsResponse {
        stats: HubStats,
        timestamp: String,
    },
    ScanStarted {
        scan_id: Uuid,
        scan_type: ScanKind,
        target: String,
        timestamp: String,
    },
    ScanProgress {
        scan_id: Uuid,
        progress: f64,
        total: usize,
        scanned: usize,
        found_so_far: usize,
        timestamp: String,
    },
    PortFound {
        scan_id: Uuid,
        port: u16,
        service: String,
        timestamp: String,
    },
    HostFound {
        scan_id: Uuid,
        ip: String,
        method: String,
        timestamp: String,
    },
    ScanCompleted {
        scan_id: Uuid,
        result: ScanReport,
        timestamp: String,
    },
    ScanError {
        scan_id: Uuid,
        error: String,
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
    /// Operator announcement pushed to every connection. Arbitrary payload
    /// fields land at the top level of the frame.
    Broadcast {
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
        timestamp: String,
    },
    /// Out-of-band update pushed to one scan's subscribers.
    ScanUpdate {
        scan_id: Uuid,
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
        timestamp: String,
    },
}

impl Event {
    pub fn connection_established(client_id: Uuid) -> Self {
        Event::ConnectionEstablished {
            client_id,
            message: "Connected to network recon service".to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn pong(client_id: Uuid) -> Self {
        Event::Pong { client_id, timestamp: now_rfc3339() }
    }

    pub fn subscription_confirmed(scan_id: Uuid) -> Self {
        Event::SubscriptionConfirmed {
            scan_id,
            message: format!("Subscribed to scan {scan_id}"),
            timestamp: now_rfc3339(),
        }
    }

    pub fn unsubscription_confirmed(scan_id: Uuid) -> Self {
        Event::UnsubscriptionConfirmed {
            scan_id,
            message: format!("Unsubscribed from scan {scan_id}"),
            timestamp: now_rfc3339(),
        }
    }

    pub fn stats_response(stats: HubStats) -> Self {
        Event::StatsResponse { stats, timestamp: now_rfc3339() }
    }

    pub fn scan_started(scan_id: Uuid, scan_type: ScanKind, target: String) -> Self {
        Event::ScanStarted { scan_id, scan_type, target, timestamp: now_rfc3339() }
    }

    pub fn scan_progress(scan_id: Uuid, scanned: usize, total: usize, found: usize) -> Self {
        let progress = if total == 0 {
            100.0
        } else {
            scanned as f64 / total as f64 * 100.0
        };
        Event::ScanProgress {
            scan_id,
            progress,
            total,
            scanned,
            found_so_far: found,
            timestamp: now_rfc3339(),
        }
    }

    pub fn port_found(scan_id: Uuid, port: u16, service: String) -> Self {
        Event::PortFound { scan_id, port, service, timestamp: now_rfc3339() }
    }

    pub fn host_found(scan_id: Uuid, ip: String, method: String) -> Self {
        Event::HostFound { scan_id, ip, method, timestamp: now_rfc3339() }
    }

    pub fn scan_completed(scan_id: Uuid, result: ScanReport) -> Self {
        Event::ScanCompleted { scan_id, result, timestamp: now_rfc3339() }
    }

    pub fn scan_error(scan_id: Uuid, error: impl Into<String>) -> Self {
        Event::ScanError { scan_id, error: error.into(), timestamp: now_rfc3339() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error { message: message.into(), timestamp: now_rfc3339() }
    }

    pub fn broadcast(mut payload: serde_json::Map<String, serde_json::Value>) -> Self {
        strip_envelope_keys(&mut payload);
        Event::Broadcast { payload, timestamp: now_rfc3339() }
    }

    pub fn scan_update(scan_id: Uuid, mut payload: serde_json::Map<String, serde_json::Value>) -> Self {
        strip_envelope_keys(&mut payload);
        payload.remove("scan_id");
        Event::ScanUpdate { scan_id, payload, timestamp: now_rfc3339() }
    }
}

/// The envelope owns `type` and `timestamp`; a payload carrying either
/// would duplicate keys in the serialized frame.
fn strip_envelope_keys(payload: &mut serde_json::Map<String, serde_json::Value>) {
    payload.remove("type");
    payload.remove("timestamp");
}

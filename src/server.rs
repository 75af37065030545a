use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::ScanError,
    protocol::{decode_command, ClientCommand, CommandError, Event},
    registry::ConnectionHub,
    scheduler::{
        DiscoveryMethod, ScanDepth, Scheduler, DEFAULT_DISCOVERY_CONCURRENCY,
        DEFAULT_SCAN_CONCURRENCY,
    },
    store::ResultStore,
};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn ResultStore>,
}

#[derive(Debug, Deserialize)]
pub struct PortScanRequest {
    pub target: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub port_range: Option<String>,
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scan_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiscoveryRequest {
    pub network: String,
    #[serde(default)]
    pub method: DiscoveryMethod,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_discovery_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Deserialize)]
pub struct VulnScanRequest {
    pub target: String,
    #[serde(default)]
    pub depth: ScanDepth,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_scan_timeout() -> u64 {
    3
}
fn default_discovery_timeout() -> u64 {
    2
}
fn default_scan_concurrency() -> usize {
    DEFAULT_SCAN_CONCURRENCY
}
fn default_discovery_concurrency() -> usize {
    DEFAULT_DISCOVERY_CONCURRENCY
}
fn default_history_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct ApiError {
    detail: String,
}

fn reject(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(ApiError { detail: detail.into() })).into_response()
}

fn reject_scan_error(e: ScanError) -> Response {
    let status = if e.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    reject(status, e.to_string())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/network/port-scan", post(port_scan))
        .route("/api/network/network-discovery", post(network_discovery))
        .route("/api/network/vulnerability-scan", post(vulnerability_scan))
        .route("/api/network/scan-result/{id}", get(scan_result))
        .route("/api/network/scan-history", get(scan_history))
        .route("/ws/stats", get(ws_stats))
        .route("/ws/connect", get(ws_connect))
        .route("/ws/broadcast", post(ws_broadcast))
        .route("/ws/notify-scan-update/{scan_id}", post(ws_notify_scan_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn port_scan(State(state): State<AppState>, Json(req): Json<PortScanRequest>) -> Response {
    let scan_id = Uuid::new_v4();
    match state
        .scheduler
        .port_scan_job(
            scan_id,
            &req.target,
            &req.ports,
            req.port_range.as_deref(),
            Duration::from_secs(req.timeout_secs.max(1)),
            req.max_concurrency,
        )
        .await
    {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => reject_scan_error(e),
    }
}

async fn network_discovery(
    State(state): State<AppState>,
    Json(req): Json<DiscoveryRequest>,
) -> Response {
    let scan_id = Uuid::new_v4();
    match state
        .scheduler
        .discovery_job(
            scan_id,
            &req.network,
            req.method,
            Duration::from_secs(req.timeout_secs.max(1)),
            req.max_concurrency,
        )
        .await
    {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => reject_scan_error(e),
    }
}

async fn vulnerability_scan(
    State(state): State<AppState>,
    Json(req): Json<VulnScanRequest>,
) -> Response {
    let scan_id = Uuid::new_v4();
    match state.scheduler.vulnerability_job(scan_id, &req.target, req.depth).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => reject_scan_error(e),
    }
}

async fn scan_result(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id).await {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => reject(StatusCode::NOT_FOUND, "scan result not found"),
    }
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    scans: Vec<crate::types::ScanJob>,
    total_count: usize,
}

async fn scan_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let scans = state.store.list(q.limit).await;
    let total_count = state.store.count().await;
    (StatusCode::OK, Json(HistoryResponse { scans, total_count })).into_response()
}

async fn ws_stats(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.hub.stats().await)).into_response()
}

async fn ws_connect(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| session(socket, state))
}

#[derive(Debug, Serialize)]
struct PushAck {
    status: &'static str,
    message: String,
}

/// Operator push to every connected client.
async fn ws_broadcast(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Map<String, serde_json::Value>>,
) -> Response {
    state.hub.broadcast(&Event::broadcast(payload)).await;
    let ack = PushAck { status: "success", message: "Message broadcasted".to_string() };
    (StatusCode::OK, Json(ack)).into_response()
}

/// Operator push to one scan's subscribers, for updates that originate
/// outside the scheduler.
async fn ws_notify_scan_update(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
    Json(payload): Json<serde_json::Map<String, serde_json::Value>>,
) -> Response {
    state.hub.publish(scan_id, &Event::scan_update(scan_id, payload)).await;
    let ack = PushAck {
        status: "success",
        message: format!("Update sent to scan {scan_id} subscribers"),
    };
    (StatusCode::OK, Json(ack)).into_response()
}

/// One client session: register, welcome, pump messages, deregister.
///
/// Outbound events arrive through the hub's per-connection channel and are
/// interleaved with inbound frames in one select loop. Any transport error
/// falls through to the single deregister at the bottom, so double-close
/// is naturally idempotent.
async fn session(mut socket: WebSocket, state: AppState) {
    let (tx, mut events) = mpsc::unbounded_channel();
    let client_id = state.hub.register(tx).await;
    state.hub.send(client_id, &Event::connection_established(client_id)).await;

    loop {
        tokio::select! {
            outbound = events.recv() => {
                let Some(event) = outbound else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&state, client_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Binary frames and transport pings are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.deregister(client_id).await;
    debug!(client_id = %client_id, "session closed");
}

/// Decode and dispatch one inbound frame. Every outcome, including
/// unknown types and malformed payloads, answers with an event; the
/// session is never closed from here.
pub async fn handle_command(state: &AppState, client_id: Uuid, text: &str) {
    match decode_command(text) {
        Ok(ClientCommand::Ping) => {
            state.hub.send(client_id, &Event::pong(client_id)).await;
        }
        Ok(ClientCommand::SubscribeScan { scan_id }) => {
            state.hub.subscribe(client_id, scan_id).await;
            state.hub.send(client_id, &Event::subscription_confirmed(scan_id)).await;
        }
        Ok(ClientCommand::UnsubscribeScan { scan_id }) => {
            state.hub.unsubscribe(client_id, scan_id).await;
            state.hub.send(client_id, &Event::unsubscription_confirmed(scan_id)).await;
        }
        Ok(ClientCommand::GetStats) => {
            let stats = state.hub.stats().await;
            state.hub.send(client_id, &Event::stats_response(stats)).await;
        }
        Ok(ClientCommand::StartRealtimeScan { config }) => {
            let scan_id = Uuid::new_v4();
            state.hub.subscribe(client_id, scan_id).await;
            state.hub
                .send(
                    client_id,
                    &Event::scan_started(scan_id, config.kind.into(), config.target.clone()),
                )
                .await;
            // Returns as soon as the job is spawned; progress arrives via
            // the subscription.
            state.scheduler.spawn_realtime(scan_id, config).await;
        }
        Err(CommandError::UnknownType(kind)) => {
            state.hub
                .send(client_id, &Event::error(format!("Unknown message type: {kind}")))
                .await;
        }
        Err(CommandError::Malformed(detail)) => {
            state.hub
                .send(client_id, &Event::error(format!("Invalid message: {detail}")))
                .await;
        }
    }
}

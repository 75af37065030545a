use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netrecon_rs::ports::service_label;
use netrecon_rs::prober::Prober;
use netrecon_rs::protocol::Event;
use netrecon_rs::registry::ConnectionHub;
use netrecon_rs::scheduler::Scheduler;
use netrecon_rs::server::{handle_command, AppState};
use netrecon_rs::store::{MemoryStore, ResultStore};
use netrecon_rs::types::{PortOutcome, ProbeResult};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Prober answering open for a fixed port list, without any sockets.
struct FixedProber {
    open_ports: Vec<u16>,
}

#[async_trait]
impl Prober for FixedProber {
    async fn probe(&self, _addr: IpAddr, port: u16, _timeout: Duration) -> ProbeResult {
        ProbeResult {
            port,
            outcome: if self.open_ports.contains(&port) {
                PortOutcome::Open
            } else {
                PortOutcome::Closed
            },
            service: service_label(port).to_string(),
            banner: None,
            latency_ms: 0,
        }
    }
}

fn make_state(open_ports: Vec<u16>) -> AppState {
    let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
    let hub = Arc::new(ConnectionHub::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        hub.clone(),
        Arc::new(FixedProber { open_ports }),
    ));
    AppState { hub, scheduler, store }
}

/// Stand in for an open session: a registered connection we can read
/// events from directly.
async fn open_session(state: &AppState) -> (Uuid, UnboundedReceiver<Event>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let id = state.hub.register(tx).await;
    (id, rx)
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

#[tokio::test]
async fn ping_answers_pong() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(&state, id, r#"{"type":"ping"}"#).await;
    let ev = next_event(&mut rx).await;
    assert!(matches!(ev, Event::Pong { client_id, .. } if client_id == id));
}

#[tokio::test]
async fn get_stats_counts_the_requesting_connection() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(&state, id, r#"{"type":"get_stats"}"#).await;
    let Event::StatsResponse { stats, .. } = next_event(&mut rx).await else {
        panic!("expected stats_response")
    };
    assert_eq!(stats.total_connections, 1);
    assert!(stats.connections.contains_key(&id));
}

#[tokio::test]
async fn unknown_type_answers_error_and_keeps_session() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(&state, id, r#"{"type":"self_destruct"}"#).await;
    let Event::Error { message, .. } = next_event(&mut rx).await else {
        panic!("expected error event")
    };
    assert!(message.contains("self_destruct"));

    // The session is still alive and serviceable.
    handle_command(&state, id, r#"{"type":"ping"}"#).await;
    assert!(matches!(next_event(&mut rx).await, Event::Pong { .. }));
}

#[tokio::test]
async fn malformed_payload_answers_error() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(&state, id, "{not json").await;
    assert!(matches!(next_event(&mut rx).await, Event::Error { .. }));

    handle_command(&state, id, r#"{"type":"subscribe_scan"}"#).await;
    assert!(matches!(next_event(&mut rx).await, Event::Error { .. }));
    assert_eq!(state.hub.stats().await.total_connections, 1);
}

#[tokio::test]
async fn subscribe_and_unsubscribe_confirmed() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;
    let scan_id = Uuid::new_v4();

    handle_command(
        &state,
        id,
        &format!(r#"{{"type":"subscribe_scan","scan_id":"{scan_id}"}}"#),
    )
    .await;
    assert!(matches!(
        next_event(&mut rx).await,
        Event::SubscriptionConfirmed { scan_id: s, .. } if s == scan_id
    ));
    assert_eq!(state.hub.stats().await.total_subscriptions, 1);

    handle_command(
        &state,
        id,
        &format!(r#"{{"type":"unsubscribe_scan","scan_id":"{scan_id}"}}"#),
    )
    .await;
    assert!(matches!(
        next_event(&mut rx).await,
        Event::UnsubscriptionConfirmed { .. }
    ));
    assert_eq!(state.hub.stats().await.total_subscriptions, 0);
}

#[tokio::test]
async fn realtime_scan_streams_to_the_requesting_session() {
    let state = make_state(vec![80]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(
        &state,
        id,
        r#"{"type":"start_realtime_scan","config":{"target":"10.0.0.9","ports":[80,81,82],"timeout_secs":1}}"#,
    )
    .await;

    // scan_started arrives synchronously; the rest streams from the
    // background job through the auto-subscription.
    let Event::ScanStarted { scan_id, .. } = next_event(&mut rx).await else {
        panic!("expected scan_started first")
    };

    let mut saw_port_found = false;
    loop {
        match next_event(&mut rx).await {
            Event::PortFound { port, scan_id: s, .. } => {
                assert_eq!(s, scan_id);
                assert_eq!(port, 80);
                saw_port_found = true;
            }
            Event::ScanCompleted { scan_id: s, .. } => {
                assert_eq!(s, scan_id);
                break;
            }
            Event::ScanProgress { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_port_found, "open port should stream before completion");

    // The finished job is queryable afterwards.
    let job = state.store.get(scan_id).await.expect("job recorded");
    assert_eq!(job.target, "10.0.0.9");
}

#[tokio::test]
async fn realtime_scan_with_bad_target_reports_scan_error() {
    let state = make_state(vec![]);
    let (id, mut rx) = open_session(&state).await;

    handle_command(
        &state,
        id,
        r#"{"type":"start_realtime_scan","config":{"target":"!!!"}}"#,
    )
    .await;

    assert!(matches!(next_event(&mut rx).await, Event::ScanStarted { .. }));
    assert!(matches!(next_event(&mut rx).await, Event::ScanError { .. }));
    assert_eq!(state.store.count().await, 0);
}

#[tokio::test]
async fn disconnect_mid_scan_does_not_crash_the_job() {
    let state = make_state(vec![80]);
    let (id, rx) = open_session(&state).await;

    handle_command(
        &state,
        id,
        r#"{"type":"start_realtime_scan","config":{"target":"10.0.0.9","ports":[80,81,82,83,84]}}"#,
    )
    .await;
    // Client goes away immediately; deliveries cascade the connection out
    // and the scan still runs to completion.
    drop(rx);
    state.hub.deregister(id).await;

    let scan_id = loop {
        let jobs = state.scheduler.active_jobs().await;
        if let Some(id) = jobs.first() {
            break *id;
        }
        // The job may already be done; look in the store.
        let recent = state.store.list(1).await;
        if let Some(job) = recent.first() {
            break job.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(job) = state.store.get(scan_id).await {
            if job.finished_at.is_some() {
                assert_eq!(job.status, netrecon_rs::types::JobStatus::Completed);
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

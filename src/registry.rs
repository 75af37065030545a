use crate::protocol::Event;
use crate::types::now_rfc3339;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound transport handle for one client. The session task owns the
/// receiving end and writes each event to the socket; a closed receiver
/// marks the connection dead.
pub type EventSender = mpsc::UnboundedSender<Event>;

struct Connection {
    sender: EventSender,
    connected_at: String,
    last_activity: String,
    subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<Uuid, Connection>,
    /// scan id -> subscribed connection ids. A connection id appears here
    /// iff it is registered and actively subscribed.
    subscriptions: HashMap<Uuid, HashSet<Uuid>>,
}

/// Tracks live client connections and scan subscriptions, and fans scan
/// events out to exactly the subscribed set.
///
/// One lock guards both maps so deregistration's purge of subscription
/// sets is atomic with respect to a concurrent publish snapshot.
#[derive(Default)]
pub struct ConnectionHub {
    inner: Mutex<HubInner>,
}

/// Read-only snapshot of hub state.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub active_scans: usize,
    pub total_subscriptions: usize,
    pub connections: HashMap<Uuid, ConnectionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connected_at: String,
    pub last_activity: String,
    pub subscriptions: usize,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its opaque id.
    pub async fn register(&self, sender: EventSender) -> Uuid {
        let id = Uuid::new_v4();
        let now = now_rfc3339();
        let mut inner = self.inner.lock().await;
        inner.connections.insert(
            id,
            Connection {
                sender,
                connected_at: now.clone(),
                last_activity: now,
                subscriptions: HashSet::new(),
            },
        );
        debug!(client_id = %id, "client connected");
        id
    }

    /// Remove a connection and purge it from every subscription set.
    /// Idempotent: deregistering an unknown id is a no-op.
    pub async fn deregister(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        remove_connection(&mut inner, id);
    }

    /// Best-effort delivery to one connection. A failed send means the
    /// receiving session is gone; the connection is removed the same way
    /// an explicit deregister would.
    pub async fn send(&self, id: Uuid, event: &Event) {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return;
        };
        if conn.sender.send(event.clone()).is_ok() {
            conn.last_activity = now_rfc3339();
        } else {
            warn!(client_id = %id, "delivery failed, dropping connection");
            remove_connection(&mut inner, id);
        }
    }

    /// Subscribe a connection to a scan. Idempotent; false if the
    /// connection is not registered.
    pub async fn subscribe(&self, id: Uuid, scan_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        conn.subscriptions.insert(scan_id);
        inner.subscriptions.entry(scan_id).or_default().insert(id);
        true
    }

    /// Unsubscribe a connection from a scan. A no-op when not subscribed.
    pub async fn unsubscribe(&self, id: Uuid, scan_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.subscriptions.remove(&scan_id);
        }
        if let Some(subs) = inner.subscriptions.get_mut(&scan_id) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.subscriptions.remove(&scan_id);
            }
        }
    }

    /// Deliver an event to every connection subscribed to `scan_id` at
    /// call time. The subscriber set is snapshotted under the lock, then
    /// delivery happens outside it against the snapshot; connections whose
    /// sender is gone are cascaded out. Never fails toward the publisher.
    pub async fn publish(&self, scan_id: Uuid, event: &Event) {
        let snapshot: Vec<(Uuid, EventSender)> = {
            let inner = self.inner.lock().await;
            let Some(subs) = inner.subscriptions.get(&scan_id) else {
                return;
            };
            subs.iter()
                .filter_map(|id| inner.connections.get(id).map(|c| (*id, c.sender.clone())))
                .collect()
        };
        self.deliver(snapshot, event).await;
    }

    /// Deliver an event to every registered connection, subscribed or not.
    /// Same snapshot-then-deliver shape as [`publish`](Self::publish), with
    /// the same dead-connection cascade.
    pub async fn broadcast(&self, event: &Event) {
        let snapshot: Vec<(Uuid, EventSender)> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .iter()
                .map(|(id, c)| (*id, c.sender.clone()))
                .collect()
        };
        self.deliver(snapshot, event).await;
    }

    /// Send to a snapshot of connections, then take the lock once to stamp
    /// activity on survivors and remove the dead. A send against an id
    /// deregistered mid-flight just misses the map and is ignored.
    async fn deliver(&self, snapshot: Vec<(Uuid, EventSender)>, event: &Event) {
        if snapshot.is_empty() {
            return;
        }
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(event.clone()).is_ok() {
                alive.push(id);
            } else {
                dead.push(id);
            }
        }
        let mut inner = self.inner.lock().await;
        let now = now_rfc3339();
        for id in alive {
            if let Some(conn) = inner.connections.get_mut(&id) {
                conn.last_activity = now.clone();
            }
        }
        for id in dead {
            warn!(client_id = %id, "receiver gone, dropping connection");
            remove_connection(&mut inner, id);
        }
    }

    /// Counts and per-connection metadata. Snapshot only; does not block
    /// registration beyond the copy.
    pub async fn stats(&self) -> HubStats {
        let inner = self.inner.lock().await;
        HubStats {
            total_connections: inner.connections.len(),
            active_scans: inner.subscriptions.len(),
            total_subscriptions: inner.subscriptions.values().map(HashSet::len).sum(),
            connections: inner
                .connections
                .iter()
                .map(|(id, c)| {
                    (
                        *id,
                        ConnectionStats {
                            connected_at: c.connected_at.clone(),
                            last_activity: c.last_activity.clone(),
                            subscriptions: c.subscriptions.len(),
                        },
                    )
                })
                .collect(),
        }
    }
}

fn remove_connection(inner: &mut HubInner, id: Uuid) {
    let Some(conn) = inner.connections.remove(&id) else {
        return;
    };
    for scan_id in conn.subscriptions {
        if let Some(subs) = inner.subscriptions.get_mut(&scan_id) {
            subs.remove(&id);
            if subs.is_empty() {
                inner.subscriptions.remove(&scan_id);
            }
        }
    }
    debug!(client_id = %id, "client disconnected");
}

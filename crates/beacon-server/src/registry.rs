use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::hub::HubStatus;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Unique peer connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One peer's duplex channel. Owned exclusively by the registry; the hub
/// only ever reaches it through registry iteration.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnState::Open as u8),
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Walk the connection through Closing to Closed.
    fn close(&self) {
        self.set_state(ConnState::Closing);
        self.set_state(ConnState::Closed);
    }
}

/// Per-connection send failure during a broadcast. The connection stays
/// registered; only a transport-level close removes it.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    QueueFull,

    #[error("peer channel closed")]
    PeerGone,
}

/// Outcome of one broadcast fan-out: how many of the currently open
/// connections accepted the event, plus the per-connection failures.
#[derive(Debug, Default, Serialize)]
pub struct Delivery {
    pub sent: usize,
    pub open: usize,
    #[serde(skip)]
    pub failures: Vec<(ConnectionId, SendError)>,
}

/// Registry of all connected peers and their send queues.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    status_tx: watch::Sender<HubStatus>,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, status_tx: watch::Sender<HubStatus>) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
            status_tx,
        }
    }

    /// Register a newly accepted connection as Open. Returns its ID and the
    /// receiver feeding that peer's writer task.
    pub fn add(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Arc::new(Connection::new(id.clone(), tx)));
        self.publish_count();
        (id, rx)
    }

    /// Remove a connection. Idempotent: an explicit close and a racing
    /// close-event both land here, the second call is a no-op.
    pub fn remove(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.close();
            self.publish_count();
        }
    }

    /// Fan an encoded event out to a point-in-time snapshot of the open
    /// connections. Non-open entries are skipped and logged; one peer's
    /// failure never aborts delivery to the rest.
    pub fn broadcast(&self, text: &str) -> Delivery {
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivery = Delivery::default();
        for conn in snapshot {
            let state = conn.state();
            if state != ConnState::Open {
                tracing::debug!(conn_id = %conn.id, ?state, "skipping non-open connection");
                continue;
            }
            delivery.open += 1;

            match conn.tx.try_send(text.to_string()) {
                Ok(()) => delivery.sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %conn.id, "send queue full, dropping event for this peer");
                    delivery.failures.push((conn.id.clone(), SendError::QueueFull));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(conn_id = %conn.id, "peer channel closed mid-broadcast");
                    delivery.failures.push((conn.id.clone(), SendError::PeerGone));
                }
            }
        }
        delivery
    }

    /// Count of registered connections in any state.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Force-close every registered connection and empty the registry.
    /// Dropping the registry's send half wakes each writer task, which closes
    /// its socket. Used only during hub shutdown.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for conn in drained {
            conn.close();
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        let clients = self.connections.len();
        self.status_tx.send_modify(|status| status.clients = clients);
    }
}

/// Drive one WebSocket connection: split into reader/writer halves, forward
/// inbound text frames to the hub, and unregister on close. Removal on
/// transition to Closed is the registry's rule, enforced here.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    inbound_tx: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued events to the socket + periodic ping.
    let writer_cid = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Registry dropped the send half: forced shutdown.
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader task: forward text frames to the inbound channel.
    let reader_cid = conn_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(res) = ws_rx.next().await {
            match res {
                Ok(WsMessage::Text(text)) => {
                    if inbound_tx
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                // axum replies to pings automatically
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(conn_id = %reader_cid, error = %e, "connection error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.remove(&conn_id);
    tracing::info!(conn_id = %conn_id, "peer disconnected");
}

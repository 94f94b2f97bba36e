//! The broadcast hub: lifecycle state machine (`Stopped`/`Running`), the
//! `notify` fan-out, and status publication for observers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use beacon_core::codec::{self, DecodeError};
use beacon_core::events::{Event, DEFAULT_SOURCE};

use crate::error::HubError;
use crate::registry::{ConnectionId, ConnectionRegistry, Delivery};
use crate::server::{self, AppState};

/// Well-known port peers dial by default.
pub const DEFAULT_PORT: u16 = 3010;

const INBOUND_QUEUE: usize = 1024;

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Port for the WebSocket endpoint. Port 0 binds an ephemeral port.
    pub port: u16,
    /// Capacity of each peer's send queue.
    pub max_send_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_send_queue: 256,
        }
    }
}

/// Millisecond-epoch clock used to stamp outbound events. Injected so tests
/// can pin time.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Lifecycle state of the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Stopped,
    Running,
}

/// Snapshot published through the status watch channel on every state
/// transition and every registry change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStatus {
    pub running: bool,
    pub clients: usize,
}

/// Outcome of `start`. Starting a running hub is a reported no-op, never an
/// error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Bound and accepting; carries the actual port (useful with port 0).
    Started { port: u16 },
    AlreadyRunning,
}

/// Outcome of `stop`. Stopping a stopped hub is a reported no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Everything `notify` needs, independent of the lifecycle lock. Shared with
/// the server tasks.
pub struct HubCore {
    registry: Arc<ConnectionRegistry>,
    status_tx: watch::Sender<HubStatus>,
    clock: Clock,
}

impl HubCore {
    pub fn is_running(&self) -> bool {
        self.status_tx.borrow().running
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscribe(&self) -> watch::Receiver<HubStatus> {
        self.status_tx.subscribe()
    }

    /// Broadcast a restart event tagged with `source` to every open peer.
    ///
    /// Broadcasting into a stopped or peerless hub is a normal operational
    /// situation: it is logged and yields zero counts, never an error. The
    /// returned counts reflect a dispatch attempt to every open connection.
    pub fn notify(&self, source: &str) -> Delivery {
        if !self.is_running() {
            tracing::debug!(source, "hub stopped, nothing to deliver");
            return Delivery::default();
        }

        let event = Event::restart(source, (self.clock)());
        let text = match codec::encode(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode event");
                return Delivery::default();
            }
        };

        let delivery = self.registry.broadcast(&text);
        if delivery.open == 0 {
            tracing::warn!(source, "no connected peers, event not delivered");
        } else {
            tracing::info!(
                source,
                sent = delivery.sent,
                open = delivery.open,
                "broadcast restart event"
            );
        }
        delivery
    }
}

struct ServerTasks {
    port: u16,
    serve: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

struct HubInner {
    state: HubState,
    tasks: Option<ServerTasks>,
}

/// The notification hub. Construct one per process and share it by
/// reference; there is no global instance.
pub struct Hub {
    config: HubConfig,
    core: Arc<HubCore>,
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_clock(config, Arc::new(|| chrono::Utc::now().timestamp_millis()))
    }

    pub fn with_clock(config: HubConfig, clock: Clock) -> Self {
        let (status_tx, _) = watch::channel(HubStatus::default());
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_send_queue,
            status_tx.clone(),
        ));
        Self {
            config,
            core: Arc::new(HubCore {
                registry,
                status_tx,
                clock,
            }),
            inner: Mutex::new(HubInner {
                state: HubState::Stopped,
                tasks: None,
            }),
        }
    }

    /// Bind the endpoint and begin accepting peers.
    ///
    /// Idempotent: a running hub reports `AlreadyRunning` instead of
    /// rebinding. A bind failure is surfaced to the caller and leaves the
    /// hub stopped; there is no automatic retry. `quiet` downgrades the
    /// user-visible startup notice (auto-start should not be noisy).
    pub async fn start(&self, quiet: bool) -> Result<StartOutcome, HubError> {
        let mut inner = self.inner.lock().await;
        if inner.state == HubState::Running {
            tracing::info!("hub already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| HubError::Bind {
            port: self.config.port,
            source: e,
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| HubError::Bind {
                port: self.config.port,
                source: e,
            })?
            .port();

        let (inbound_tx, inbound_rx) = mpsc::channel::<(ConnectionId, String)>(INBOUND_QUEUE);
        let inbound = tokio::spawn(process_inbound(inbound_rx, Arc::clone(&self.core)));

        let router = server::build_router(AppState {
            core: Arc::clone(&self.core),
            registry: Arc::clone(&self.core.registry),
            inbound_tx,
        });
        let serve = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        inner.state = HubState::Running;
        inner.tasks = Some(ServerTasks {
            port,
            serve,
            inbound,
        });
        self.core.status_tx.send_modify(|status| status.running = true);

        if quiet {
            tracing::debug!(port, "notification hub listening");
        } else {
            tracing::info!(port, "notification hub listening");
        }
        Ok(StartOutcome::Started { port })
    }

    /// Close the endpoint and force-close every registered peer.
    ///
    /// This is the hub's cancellation primitive; idempotent like `start`.
    pub async fn stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        if inner.state == HubState::Stopped {
            tracing::info!("hub not running");
            return StopOutcome::NotRunning;
        }

        if let Some(tasks) = inner.tasks.take() {
            tasks.serve.abort();
            tasks.inbound.abort();
        }
        self.core.registry.close_all();

        inner.state = HubState::Stopped;
        self.core.status_tx.send_modify(|status| status.running = false);
        tracing::info!("notification hub stopped");
        StopOutcome::Stopped
    }

    /// Broadcast a restart event tagged with `source` to every open peer.
    pub fn notify(&self, source: &str) -> Delivery {
        self.core.notify(source)
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn client_count(&self) -> usize {
        self.core.client_count()
    }

    /// Observe running state and client count without polling.
    pub fn subscribe(&self) -> watch::Receiver<HubStatus> {
        self.core.subscribe()
    }

    /// Actual bound port while running.
    pub async fn port(&self) -> Option<u16> {
        self.inner.lock().await.tasks.as_ref().map(|t| t.port)
    }
}

/// Drain inbound peer messages: decode, take the payload's source (default
/// `"peer"`), re-stamp, and re-inject as a broadcast to all peers including
/// the originator. Malformed or unrecognized payloads are logged and
/// dropped; the sending peer stays connected.
async fn process_inbound(mut rx: mpsc::Receiver<(ConnectionId, String)>, core: Arc<HubCore>) {
    while let Some((conn_id, raw)) = rx.recv().await {
        match codec::decode(&raw) {
            Ok(payload) => {
                let source = payload
                    .source
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
                let delivery = core.notify(&source);
                tracing::debug!(
                    conn_id = %conn_id,
                    source = %source,
                    sent = delivery.sent,
                    open = delivery.open,
                    "re-injected peer event"
                );
            }
            Err(DecodeError::UnknownKind(tag)) => {
                tracing::warn!(conn_id = %conn_id, kind = %tag, "unrecognized event kind, dropping");
            }
            Err(DecodeError::Malformed(e)) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "malformed payload, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsPeer = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn started_hub() -> (Arc<Hub>, u16) {
        let hub = Arc::new(Hub::new(HubConfig {
            port: 0,
            ..Default::default()
        }));
        let outcome = hub.start(true).await.unwrap();
        let StartOutcome::Started { port } = outcome else {
            panic!("expected fresh start, got {outcome:?}");
        };
        (hub, port)
    }

    async fn connect_peer(port: u16) -> WsPeer {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("peer failed to connect");
        ws
    }

    async fn wait_for_clients(hub: &Hub, n: usize) {
        for _ in 0..100 {
            if hub.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client count never reached {n} (now {})", hub.client_count());
    }

    async fn recv_event(ws: &mut WsPeer) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn assert_no_event(ws: &mut WsPeer) {
        let res = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(res.is_err(), "expected no event, got {res:?}");
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let (hub, _port) = started_hub().await;
        assert!(hub.is_running());

        let second = hub.start(true).await.unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning);
        assert!(hub.is_running());

        hub.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_reports_not_running() {
        let (hub, _port) = started_hub().await;

        assert_eq!(hub.stop().await, StopOutcome::Stopped);
        assert!(!hub.is_running());
        assert_eq!(hub.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn hub_restarts_after_stop() {
        let (hub, _port) = started_hub().await;
        hub.stop().await;

        let again = hub.start(true).await.unwrap();
        assert!(matches!(again, StartOutcome::Started { .. }));
        assert!(hub.is_running());
        hub.stop().await;
    }

    #[tokio::test]
    async fn notify_while_stopped_delivers_nothing() {
        let hub = Hub::new(HubConfig {
            port: 0,
            ..Default::default()
        });
        let delivery = hub.notify("editor");
        assert_eq!(delivery.sent, 0);
        assert_eq!(delivery.open, 0);
        assert!(delivery.failures.is_empty());
    }

    #[tokio::test]
    async fn notify_with_no_peers_returns_zero() {
        let (hub, _port) = started_hub().await;
        let delivery = hub.notify("editor");
        assert_eq!(delivery.sent, 0);
        assert_eq!(delivery.open, 0);
        hub.stop().await;
    }

    #[tokio::test]
    async fn notify_reaches_every_connected_peer() {
        let (hub, port) = started_hub().await;
        let mut peer_a = connect_peer(port).await;
        let mut peer_b = connect_peer(port).await;
        wait_for_clients(&hub, 2).await;

        let before = chrono::Utc::now().timestamp_millis();
        let delivery = hub.notify("editor");
        let after = chrono::Utc::now().timestamp_millis();
        assert_eq!(delivery.sent, 2);
        assert_eq!(delivery.open, 2);

        for peer in [&mut peer_a, &mut peer_b] {
            let event = recv_event(peer).await;
            assert_eq!(event["kind"], "restart");
            assert_eq!(event["source"], "editor");
            let ts = event["timestamp"].as_i64().unwrap();
            assert!(ts >= before && ts <= after);
        }

        hub.stop().await;
    }

    #[tokio::test]
    async fn inbound_restart_is_rebroadcast_to_all_peers() {
        let (hub, port) = started_hub().await;
        let mut peer_a = connect_peer(port).await;
        let mut peer_b = connect_peer(port).await;
        wait_for_clients(&hub, 2).await;

        peer_a
            .send(Message::Text(
                r#"{"type":"restart","source":"roblox"}"#.into(),
            ))
            .await
            .unwrap();

        // Fan-out includes the originator.
        for peer in [&mut peer_a, &mut peer_b] {
            let event = recv_event(peer).await;
            assert_eq!(event["kind"], "restart");
            assert_eq!(event["source"], "roblox");
        }

        hub.stop().await;
    }

    #[tokio::test]
    async fn inbound_without_source_uses_default() {
        let (hub, port) = started_hub().await;
        let mut peer = connect_peer(port).await;
        wait_for_clients(&hub, 1).await;

        peer.send(Message::Text(r#"{"kind":"restart"}"#.into()))
            .await
            .unwrap();

        let event = recv_event(&mut peer).await;
        assert_eq!(event["source"], "peer");

        hub.stop().await;
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped_without_disconnect() {
        let (hub, port) = started_hub().await;
        let mut peer_a = connect_peer(port).await;
        let mut peer_b = connect_peer(port).await;
        wait_for_clients(&hub, 2).await;

        peer_a
            .send(Message::Text(r#"{"type":"reload"}"#.into()))
            .await
            .unwrap();
        assert_no_event(&mut peer_b).await;
        assert_eq!(hub.client_count(), 2);

        // The offending peer is still connected and can trigger broadcasts.
        peer_a
            .send(Message::Text(r#"{"type":"restart","source":"a"}"#.into()))
            .await
            .unwrap();
        let event = recv_event(&mut peer_b).await;
        assert_eq!(event["source"], "a");

        hub.stop().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_disconnect() {
        let (hub, port) = started_hub().await;
        let mut peer = connect_peer(port).await;
        wait_for_clients(&hub, 1).await;

        peer.send(Message::Text("{{{nope".into())).await.unwrap();
        assert_no_event(&mut peer).await;
        assert_eq!(hub.client_count(), 1);

        hub.stop().await;
    }

    #[tokio::test]
    async fn closed_peer_is_removed_and_skipped() {
        let (hub, port) = started_hub().await;
        let mut peer_a = connect_peer(port).await;
        let mut peer_b = connect_peer(port).await;
        wait_for_clients(&hub, 2).await;

        peer_a.close(None).await.unwrap();
        wait_for_clients(&hub, 1).await;

        let delivery = hub.notify("editor");
        assert_eq!(delivery.sent, 1);
        assert_eq!(delivery.open, 1);
        let event = recv_event(&mut peer_b).await;
        assert_eq!(event["source"], "editor");

        hub.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_peer_sockets() {
        let (hub, port) = started_hub().await;
        let mut peer = connect_peer(port).await;
        wait_for_clients(&hub, 1).await;

        hub.stop().await;
        assert_eq!(hub.client_count(), 0);

        // Peer observes a close frame or end-of-stream.
        let got_close = loop {
            match tokio::time::timeout(Duration::from_secs(2), peer.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break true,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => break true,
                Err(_) => break false,
            }
        };
        assert!(got_close, "peer socket was not closed by stop()");
    }

    #[tokio::test]
    async fn bind_conflict_surfaces_error_and_stays_stopped() {
        let (hub, port) = started_hub().await;

        let contender = Hub::new(HubConfig {
            port,
            ..Default::default()
        });
        let err = contender.start(true).await.unwrap_err();
        assert!(matches!(err, HubError::Bind { port: p, .. } if p == port));
        assert!(!contender.is_running());

        hub.stop().await;
    }

    #[tokio::test]
    async fn status_watch_observes_transitions() {
        let hub = Arc::new(Hub::new(HubConfig {
            port: 0,
            ..Default::default()
        }));
        let mut status_rx = hub.subscribe();
        assert!(!status_rx.borrow().running);

        hub.start(true).await.unwrap();
        let running = tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| s.running),
        )
        .await
        .unwrap()
        .unwrap();
        drop(running);

        let port = hub.port().await.unwrap();
        let _peer = connect_peer(port).await;
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| s.clients == 1),
        )
        .await
        .unwrap()
        .unwrap();

        hub.stop().await;
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| !s.running && s.clients == 0),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn injected_clock_stamps_events() {
        let hub = Arc::new(Hub::with_clock(
            HubConfig {
                port: 0,
                ..Default::default()
            },
            Arc::new(|| 12_345),
        ));
        hub.start(true).await.unwrap();
        let port = hub.port().await.unwrap();

        let mut peer = connect_peer(port).await;
        wait_for_clients(&hub, 1).await;

        hub.notify("editor");
        let event = recv_event(&mut peer).await;
        assert_eq!(event["timestamp"], 12_345);

        hub.stop().await;
    }
}

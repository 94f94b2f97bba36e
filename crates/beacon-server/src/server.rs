//! HTTP surface: WebSocket upgrade for peers, plus the health and local
//! trigger endpoints used by out-of-process producers and observers.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use beacon_core::events::DEFAULT_SOURCE;

use crate::hub::HubCore;
use crate::registry::{self, ConnectionId, ConnectionRegistry};

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<HubCore>,
    pub registry: Arc<ConnectionRegistry>,
    pub inbound_tx: mpsc::Sender<(ConnectionId, String)>,
}

/// Build the router: WebSocket upgrade on `/` and `/ws`, health, and the
/// local notify trigger.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/notify", post(notify_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // A stop() racing the accept path: refuse rather than register into a
    // hub that is tearing down.
    if !state.core.is_running() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn_id, rx) = state.registry.add();
    if !state.core.is_running() {
        // stop() won between the upgrade check and registration.
        state.registry.remove(&conn_id);
        return;
    }
    tracing::info!(conn_id = %conn_id, "peer connected");

    registry::handle_ws_connection(socket, conn_id, rx, state.registry, state.inbound_tx).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "running": state.core.is_running(),
        "clients": state.core.client_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct NotifyParams {
    source: Option<String>,
}

/// Local trigger for producers that are not WebSocket peers (an explicit
/// user action, a file-save observer). Responds with the delivery counts.
async fn notify_handler(
    State(state): State<AppState>,
    body: Option<Json<NotifyParams>>,
) -> impl IntoResponse {
    let source = body
        .and_then(|Json(params)| params.source)
        .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
    let delivery = state.core.notify(&source);
    Json(delivery)
}

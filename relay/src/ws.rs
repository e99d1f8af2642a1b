//! WebSocket server: connection lifecycle and frame transport.
//!
//! Authentication happens before the gateway ever sees the connection: the
//! bearer token rides the upgrade request as a `?token=` query parameter,
//! mirroring what the UI clients send. A rejected credential closes the
//! socket with a policy violation code and nothing else is exchanged.

use crate::auth::Authenticator;
use crate::error::RelayError;
use crate::gateway::Gateway;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use iotbridge_shared::AuthError;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub authenticator: Arc<dyn Authenticator>,
}

/// Build the HTTP router: WebSocket upgrade plus liveness probe.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "broker_connected": state.gateway.broker_connected(),
        "connections": state.gateway.connection_count(),
        "watched_devices": state.gateway.watched_device_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let verified = match token.as_deref() {
        Some(token) => state.authenticator.verify(token),
        None => Err(AuthError::MissingCredential),
    };
    let principal = match verified {
        Ok(principal) => principal,
        Err(e) => {
            warn!(error = %RelayError::Authentication(e), "rejecting connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    info!(username = %principal.username, "user connected");
    let username = principal.username.clone();
    let (conn, mut frames) = state.gateway.register(principal);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward gateway frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Dispatch inbound frames in arrival order
    let gateway = state.gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => gateway.handle_frame(conn, &text),
                // Binary payloads go through the same decoder; anything
                // that is not frame JSON comes back as an error frame
                Ok(Message::Binary(data)) => {
                    gateway.handle_frame(conn, &String::from_utf8_lossy(&data))
                }
                Ok(Message::Close(_)) => {
                    debug!(%conn, "client closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(%conn, error = %e, "websocket receive error");
                    break;
                }
            }
        }
    });

    // Whichever side ends first tears the connection down
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.gateway.disconnect(conn);
    info!(%username, "user disconnected");
}

//! WebSocket gateway for web terminals.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequestParts, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::request::Parts,
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use shell_relay_core::{ShellCommand, SpawnOptions, TermSize};
use shell_relay_session::{ConnectionId, Health, OUTBOUND_CAPACITY, Outbound, SessionManager};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    gate::{ConnectionGate, GateRejection, Identity},
    protocol::{ClientMessage, ServerMessage},
};

/// Environment variable carrying the connection's identity into the shell.
pub const IDENTITY_ENV: &str = "RELAY_IDENTITY";

/// Gateway handler state.
#[derive(Clone)]
pub struct GatewayState {
    /// Session manager shared by every connection.
    pub manager: Arc<SessionManager>,
    /// Shell to spawn per connection.
    pub shell: Arc<ShellCommand>,
    /// Spawn options shared by every connection.
    pub options: Arc<SpawnOptions>,
    /// Upstream identity hook.
    pub gate: Arc<dyn ConnectionGate>,
}

impl GatewayState {
    /// Create new gateway state.
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        shell: ShellCommand,
        options: SpawnOptions,
        gate: Arc<dyn ConnectionGate>,
    ) -> Self {
        Self {
            manager,
            shell: Arc::new(shell),
            options: Arc::new(options),
            gate,
        }
    }
}

impl FromRequestParts<GatewayState> for Identity {
    type Rejection = GateRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &GatewayState,
    ) -> Result<Self, Self::Rejection> {
        state.gate.admit(&parts.headers).await
    }
}

/// Create the gateway router: `/ws` for terminals, `/health` for monitoring.
#[must_use]
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<GatewayState>) -> Json<Health> {
    Json(state.manager.health())
}

/// WebSocket upgrade handler.
///
/// The gate runs before the upgrade; rejected connections get a 401.
pub async fn ws_handler(
    identity: Identity,
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: GatewayState, identity: Identity) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut options = (*state.options).clone();
    if let Some(subject) = &identity.subject {
        options.set_env(IDENTITY_ENV, subject);
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    match state
        .manager
        .spawn_with_fallback(connection_id, &state.shell, &options, out_tx)
        .await
    {
        Ok(backend) => {
            tracing::info!(%connection_id, %backend, subject = ?identity.subject, "Connection attached");
            let _ = tx
                .send(ServerMessage::SessionStarted {
                    session_id: connection_id.to_string(),
                    backend,
                })
                .await;
        }
        Err(e) => {
            let _ = tx
                .send(ServerMessage::Error {
                    message: format!("Terminal unavailable: {e}"),
                })
                .await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                // Waiting here pushes a slow socket back onto the session channel.
                Some(Outbound::Output(chunk)) => {
                    let _ = tx.send(ServerMessage::output(&chunk)).await;
                }
                // The exit notice is always the last thing a session sends.
                Some(Outbound::Notice(message)) => {
                    let _ = tx.send(ServerMessage::Notice { message }).await;
                    break;
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state.manager, connection_id, text.as_str(), &tx);
                }
                Some(Ok(Message::Binary(data))) => {
                    state.manager.input(connection_id, data);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(%connection_id, "WebSocket error: {e}");
                    break;
                }
            },
        }
    }

    state.manager.teardown(connection_id);
    drop(tx);
    let _ = send_task.await;
    tracing::info!(%connection_id, "Connection closed");
}

fn handle_client_text(
    manager: &SessionManager,
    connection_id: ConnectionId,
    text: &str,
    tx: &mpsc::Sender<ServerMessage>,
) {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%connection_id, "Invalid client message: {e}");
            let _ = tx.try_send(ServerMessage::Error {
                message: format!("Invalid message: {e}"),
            });
            return;
        }
    };

    match client_msg {
        msg @ ClientMessage::Input { .. } => match msg.decode_input() {
            Some(bytes) => {
                manager.input(connection_id, Bytes::from(bytes));
            }
            None => {
                tracing::warn!(%connection_id, "Input is not valid base64");
            }
        },
        ClientMessage::Resize { cols, rows } => {
            manager.resize(connection_id, TermSize::new(cols, rows));
        }
        ClientMessage::Ping => {
            let _ = tx.try_send(ServerMessage::Pong);
        }
    }
}

//! WebSocket upgrade handling: role admission (spec.md §4.2) and the
//! `SocketHandle` adapter wrapping an axum `WebSocket`.
//!
//! The socket is split into a read half and a write half: outbound
//! frames go through an unbounded channel into a dedicated write task,
//! while the read half is driven directly in the connection's own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roombus_protocol::{CLOSE_POLICY_VIOLATION, Role};
use roombus_room::{ConnectOutcome, ConnectionMetadata, SocketHandle, SocketState};

use crate::error::Error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebsocketQuery {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
}

/// `GET /websocket?projectId=P&type=T&apiKey?` (spec.md §4.2, §6).
pub async fn websocket_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WebsocketQuery>,
    headers: axum::http::HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(true)
    {
        return (StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade").into_response();
    }

    let Some(role) = Role::parse(&query.client_type) else {
        return Error::InvalidRole(query.client_type.clone()).into_response();
    };

    let api_key = query.api_key.clone().or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    if let Err(err) = crate::router::authorize_project(&state, &query.project_id, api_key.as_deref()).await {
        return err.into_response();
    }

    if role == Role::Runtime
        && let Some(existing) = state.rooms.get(&query.project_id)
        && existing.status().await.is_some_and(|status| status.runtime_connected)
    {
        return (
            StatusCode::CONFLICT,
            axum::Json(serde_json::json!({
                "error": "runtime already connected",
                "message": "a runtime is already connected for this project",
            })),
        )
            .into_response();
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let project_id = query.project_id.clone();
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state, project_id, role, addr, ConnectionMetadata { user_agent, origin })
    })
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    project_id: String,
    role: Role,
    remote_addr: SocketAddr,
    metadata: ConnectionMetadata,
) {
    let room = state.rooms.get_or_spawn(&project_id);
    let (ws_tx, mut ws_rx) = socket.split();
    let (socket_handle, mut outbound_rx) = WsSocketHandle::new();
    let socket_handle: Arc<dyn SocketHandle> = Arc::new(socket_handle);

    let Some(outcome) = room.connect(role, socket_handle.clone(), metadata).await else {
        return; // room already shut down underneath us
    };

    let client_id = match outcome {
        ConnectOutcome::Connected { client_id } => client_id,
        ConnectOutcome::RuntimeSingletonViolation => {
            // The pre-upgrade check in websocket_upgrade_handler already returns 409
            // for the common case; this covers the race where a second runtime wins
            // the upgrade between that check and the Room actually processing Connect.
            warn!(project_id = %project_id, remote = %remote_addr, "runtime singleton violation");
            close_with(ws_tx, outbound_rx, CLOSE_POLICY_VIOLATION).await;
            return;
        },
    };

    info!(project_id = %project_id, client_id = %client_id, role = %role, remote = %remote_addr, "websocket connected");

    let write_project_id = project_id.clone();
    let write_client_id = client_id.clone();
    let mut ws_tx = ws_tx;
    let write_handle = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(project_id = %write_project_id, client_id = %write_client_id, "write loop closed");
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => room.message(client_id.clone(), text.to_string()),
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {},
            Ok(Message::Close(_)) => break,
            Err(err) => {
                debug!(project_id = %project_id, client_id = %client_id, error = %err, "websocket read error");
                break;
            },
        }
    }

    room.disconnect(client_id);
    write_handle.abort();
}

async fn close_with(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    code: u16,
) {
    outbound_rx.close();
    let _ = ws_tx
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: "policy violation".into(),
        })))
        .await;
}

/// `SocketHandle` backed by a live axum `WebSocket`'s write half, reached
/// through an unbounded channel so the Room never awaits the transport
/// directly.
struct WsSocketHandle {
    tx: mpsc::UnboundedSender<String>,
    state: AtomicU8,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

impl WsSocketHandle {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                state: AtomicU8::new(STATE_OPEN),
            },
            rx,
        )
    }
}

#[async_trait]
impl SocketHandle for WsSocketHandle {
    async fn send(&self, text: String) -> roombus_room::Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(roombus_room::Error::SocketNotOpen);
        }
        self.tx.send(text).map_err(|_| roombus_room::Error::SocketNotOpen)
    }

    fn state(&self) -> SocketState {
        if self.tx.is_closed() || self.state.load(Ordering::Acquire) == STATE_CLOSED {
            SocketState::Closed
        } else {
            SocketState::Open
        }
    }

    async fn close(&self, _code: u16) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

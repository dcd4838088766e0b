//! The Room: a per-project actor owning connections, the pending-request
//! table, and the idle alarm (spec.md §3, §4.2–§4.6, §4.9). Realized as a
//! single spawned task draining an `mpsc::UnboundedReceiver<RoomCommand>`
//! in FIFO order, the "per-Room serialized executor" of spec.md §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use roombus_protocol::{Envelope, Role, message_type};

use crate::connection::{Connection, ConnectionMetadata};
use crate::fixture;
use crate::log_store::{Direction, HistoricalReplay, LogBucketStore, NewLog};
use crate::pending::{PendingKind, PendingRequest};
use crate::socket::SocketHandle;
use crate::usage::{UsageCounterStore, day_key};

const HISTORICAL_LOGS_LIMIT: usize = roombus_protocol::HISTORICAL_LOGS_LIMIT;

/// Outcome of a connect attempt, reported back to the caller (the front
/// router, which performed the transport-level upgrade before handing
/// the socket to the Room).
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Connected { client_id: String },
    /// An OPEN runtime already owns this Room (spec.md §4.2 singleton rule).
    RuntimeSingletonViolation,
}

#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub project_id: String,
    pub runtime_connected: bool,
    pub agent_count: usize,
    pub prod_count: usize,
    pub admin_count: usize,
    pub pending_count: usize,
}

enum RoomCommand {
    Connect {
        role: Role,
        socket: Arc<dyn SocketHandle>,
        metadata: ConnectionMetadata,
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Message {
        conn_id: String,
        text: String,
    },
    Disconnect {
        conn_id: String,
    },
    RequestTimeout {
        request_id: String,
    },
    IdleAlarm {
        generation: u64,
    },
    Status {
        reply: oneshot::Sender<RoomStatus>,
    },
    Shutdown,
}

/// A cheap, cloneable reference to a live Room actor. Dropping every
/// handle (and letting the internal `self` handle inside the task go with
/// it) does not stop the Room, only an explicit [`RoomHandle::shutdown`]
/// or the idle alarm does.
#[derive(Clone)]
pub struct RoomHandle {
    project_id: Arc<str>,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn connect(
        &self,
        role: Role,
        socket: Arc<dyn SocketHandle>,
        metadata: ConnectionMetadata,
    ) -> Option<ConnectOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Connect {
                role,
                socket,
                metadata,
                reply,
            })
            .ok()?;
        rx.await.ok()
    }

    pub fn message(&self, conn_id: impl Into<String>, text: impl Into<String>) {
        let _ = self.tx.send(RoomCommand::Message {
            conn_id: conn_id.into(),
            text: text.into(),
        });
    }

    pub fn disconnect(&self, conn_id: impl Into<String>) {
        let _ = self.tx.send(RoomCommand::Disconnect {
            conn_id: conn_id.into(),
        });
    }

    pub async fn status(&self) -> Option<RoomStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomCommand::Status { reply }).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RoomCommand::Shutdown);
    }

    /// `true` once the Room's task has exited (idle alarm fired, or an
    /// explicit shutdown was processed). A registry holding this handle
    /// should spawn a fresh Room rather than keep routing to it.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn a new Room actor for `project_id`. Returns a handle usable from
/// any task; the Room itself runs on its own `tokio::spawn`ed task and
/// touches its state from nowhere else.
pub fn spawn(
    project_id: impl Into<String>,
    log_store: Arc<dyn LogBucketStore>,
    usage_store: Arc<dyn UsageCounterStore>,
    idle_timeout: Duration,
    request_timeout: Duration,
) -> RoomHandle {
    let project_id: Arc<str> = Arc::from(project_id.into());
    let (tx, rx) = mpsc::unbounded_channel();

    let room = Room {
        project_id: project_id.clone(),
        runtime: None,
        agents: HashMap::new(),
        prods: HashMap::new(),
        admins: HashMap::new(),
        pending: HashMap::new(),
        last_activity: Utc::now(),
        idle_generation: 0,
        log_store,
        usage_store,
        idle_timeout,
        request_timeout,
        self_tx: tx.clone(),
    };

    tokio::spawn(room.run(rx));

    RoomHandle { project_id, tx }
}

struct Room {
    project_id: Arc<str>,
    runtime: Option<Connection>,
    agents: HashMap<String, Connection>,
    prods: HashMap<String, Connection>,
    admins: HashMap<String, Connection>,
    pending: HashMap<String, PendingRequest>,
    last_activity: chrono::DateTime<Utc>,
    idle_generation: u64,
    log_store: Arc<dyn LogBucketStore>,
    usage_store: Arc<dyn UsageCounterStore>,
    idle_timeout: Duration,
    request_timeout: Duration,
    self_tx: mpsc::UnboundedSender<RoomCommand>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        info!(project_id = %self.project_id, "room started");
        self.reschedule_idle_alarm();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::Connect {
                    role,
                    socket,
                    metadata,
                    reply,
                } => self.handle_connect(role, socket, metadata, reply).await,
                RoomCommand::Message { conn_id, text } => self.handle_message(conn_id, text).await,
                RoomCommand::Disconnect { conn_id } => self.handle_disconnect(conn_id).await,
                RoomCommand::RequestTimeout { request_id } => {
                    self.handle_request_timeout(request_id).await;
                },
                RoomCommand::IdleAlarm { generation } => {
                    if generation == self.idle_generation {
                        let should_suspend = self.handle_idle_alarm().await;
                        if should_suspend {
                            break;
                        }
                    }
                },
                RoomCommand::Status { reply } => {
                    let _ = reply.send(self.status());
                },
                RoomCommand::Shutdown => break,
            }
        }

        self.shutdown().await;
        info!(project_id = %self.project_id, "room stopped");
    }

    fn status(&self) -> RoomStatus {
        RoomStatus {
            project_id: self.project_id.to_string(),
            runtime_connected: self.runtime.as_ref().is_some_and(Connection::is_open),
            agent_count: self.agents.len(),
            prod_count: self.prods.len(),
            admin_count: self.admins.len(),
            pending_count: self.pending.len(),
        }
    }

    // ── Connect / disconnect ─────────────────────────────────────────────

    async fn handle_connect(
        &mut self,
        role: Role,
        socket: Arc<dyn SocketHandle>,
        metadata: ConnectionMetadata,
        reply: oneshot::Sender<ConnectOutcome>,
    ) {
        if role == Role::Runtime
            && let Some(existing) = &self.runtime
            && existing.is_open()
        {
            let _ = reply.send(ConnectOutcome::RuntimeSingletonViolation);
            return;
        }

        let client_id = Uuid::new_v4().to_string();
        let connection = Connection {
            id: client_id.clone(),
            role,
            project_id: self.project_id.clone(),
            socket: socket.clone(),
            connected_at: Utc::now(),
            metadata,
        };

        match role {
            Role::Runtime => {
                if let Some(old) = self.runtime.replace(connection) {
                    self.cancel_pending_for_runtime(&old.id);
                }
            },
            Role::Agent => {
                self.agents.insert(client_id.clone(), connection);
            },
            Role::Prod => {
                self.prods.insert(client_id.clone(), connection);
            },
            Role::Admin => {
                self.admins.insert(client_id.clone(), connection);
            },
        }

        self.touch_activity();
        info!(project_id = %self.project_id, client_id = %client_id, role = %role, "connection admitted");

        if role == Role::Admin {
            self.replay_history_to(&client_id).await;
        }

        self.send_connected(&client_id, role).await;
        let _ = reply.send(ConnectOutcome::Connected { client_id });
    }

    async fn send_connected(&self, client_id: &str, role: Role) {
        let conn = self.find_connection(client_id);
        let Some(conn) = conn else { return };

        let mut envelope = Envelope::new(message_type::CONNECTED, now_ms());
        envelope.project_id = Some(self.project_id.to_string());
        envelope = envelope
            .with_extra("clientId", serde_json::json!(client_id))
            .with_extra("clientType", serde_json::json!(role.as_str()))
            .with_extra(
                "message",
                serde_json::json!(format!("connected as {role}")),
            );

        self.send_envelope(&conn, &envelope).await;
    }

    async fn replay_history_to(&self, admin_id: &str) {
        let Some(conn) = self.admins.get(admin_id) else { return };

        match self
            .log_store
            .replay(&self.project_id, HISTORICAL_LOGS_LIMIT)
            .await
        {
            Ok(HistoricalReplay { logs, total }) => {
                let envelopes: Vec<_> = logs.iter().map(|log| log.envelope.clone()).collect();
                let mut envelope = Envelope::new(message_type::HISTORICAL_LOGS, now_ms());
                envelope.project_id = Some(self.project_id.to_string());
                envelope = envelope
                    .with_extra("logs", serde_json::Value::Array(envelopes))
                    .with_extra("count", serde_json::json!(total));
                self.send_envelope(conn, &envelope).await;
            },
            Err(err) => {
                warn!(project_id = %self.project_id, error = %err, "failed to replay log history");
            },
        }
    }

    async fn handle_disconnect(&mut self, conn_id: String) {
        if self.runtime.as_ref().is_some_and(|c| c.id == conn_id) {
            self.runtime = None;
            self.cancel_pending_for_runtime(&conn_id);
        } else {
            self.agents.remove(&conn_id);
            self.prods.remove(&conn_id);
            self.admins.remove(&conn_id);
        }

        self.touch_activity();
        debug!(project_id = %self.project_id, client_id = %conn_id, "connection removed");
        self.reschedule_idle_alarm();
    }

    // ── Message handling ─────────────────────────────────────────────────

    async fn handle_message(&mut self, conn_id: String, text: String) {
        let Some(sender) = self.find_connection(&conn_id) else {
            return;
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(err) => {
                warn!(project_id = %self.project_id, client_id = %conn_id, error = %err, "malformed envelope");
                let error_envelope =
                    Envelope::error("malformed message", None, Some(self.project_id.to_string()), now_ms());
                self.send_envelope(&sender, &error_envelope).await;
                return;
            },
        };

        self.touch_activity();
        self.fan_out_to_admins(&conn_id, &envelope).await;
        self.store_log(&envelope, Direction::Incoming, Some(&sender)).await;
        self.record_usage().await;

        self.dispatch(sender, envelope).await;
    }

    async fn dispatch(&mut self, sender: Connection, envelope: Envelope) {
        match envelope.r#type.as_str() {
            message_type::GRAPHQL_QUERY => self.handle_query_like(sender, envelope, PendingKind::Query).await,
            message_type::GET_DOCS => self.handle_query_like(sender, envelope, PendingKind::Docs).await,
            message_type::QUERY_RESPONSE => self.handle_reply(envelope, PendingKind::Query).await,
            message_type::DOCS => self.handle_reply(envelope, PendingKind::Docs).await,
            message_type::GET_PROD_UI => self.handle_get_prod_ui(sender, envelope).await,
            message_type::PROD_UI_RESPONSE => self.handle_prod_ui_response(envelope).await,
            message_type::CHECK_AGENTS => self.handle_check_agents(sender, envelope).await,
            message_type::PING => self.handle_ping(sender, envelope).await,
            message_type::ERROR => {
                warn!(project_id = %self.project_id, client_id = %sender.id, "received error envelope from client");
            },
            other => {
                warn!(project_id = %self.project_id, client_id = %sender.id, message_type = other, "unknown message type");
            },
        }
    }

    /// `graphql_query` / `get_docs`: runtime → first OPEN agent, with
    /// fallback fixture if none is available (spec.md §4.4, §9).
    async fn handle_query_like(&mut self, sender: Connection, envelope: Envelope, kind: PendingKind) {
        if sender.role != Role::Runtime {
            return;
        }
        let Some(request_id) = envelope.request_id.clone() else {
            return;
        };

        match self.first_open_agent() {
            Some(agent) => {
                let mut forwarded = envelope.clone();
                forwarded = forwarded.with_extra("runtimeId", serde_json::json!(sender.id));
                self.send_envelope(&agent, &forwarded).await;
                self.schedule_pending(request_id, sender.id.clone(), kind);
            },
            None => {
                let query_text = query_text_of(&envelope);
                let data = match kind {
                    PendingKind::Query => fixture::query_fixture(&query_text),
                    PendingKind::Docs => fixture::docs_fixture(&query_text),
                };
                let response_type = match kind {
                    PendingKind::Query => message_type::QUERY_RESPONSE,
                    PendingKind::Docs => message_type::DOCS,
                };
                let mut response = Envelope::new(response_type, now_ms());
                response.request_id = Some(request_id);
                response.project_id = Some(self.project_id.to_string());
                response.data = Some(data);
                self.send_envelope(&sender, &response).await;
            },
        }
    }

    /// `query_response` / `docs`: agent reply, correlated by `requestId`.
    async fn handle_reply(&mut self, envelope: Envelope, expected_kind: PendingKind) {
        let Some(request_id) = envelope.request_id.clone() else {
            return;
        };
        let Some((kind_matches, runtime_id)) = self
            .pending
            .get(&request_id)
            .map(|p| (p.kind == expected_kind, p.runtime_id.clone()))
        else {
            return; // duplicate or already timed out
        };
        if !kind_matches {
            return;
        }

        let runtime_is_current = self.runtime.as_ref().is_some_and(|r| r.id == runtime_id);
        if !runtime_is_current {
            // runtime reconnected or disconnected since this request was issued
            if let Some(pending) = self.pending.remove(&request_id) {
                pending.cancel();
            }
            return;
        }

        if let Some(runtime) = self.runtime.clone() {
            self.send_envelope(&runtime, &envelope).await;
        }
        if let Some(pending) = self.pending.remove(&request_id) {
            pending.cancel();
        }
    }

    /// `get_prod_ui`: prod → current runtime, annotated with `prodId`.
    async fn handle_get_prod_ui(&mut self, sender: Connection, envelope: Envelope) {
        if sender.role != Role::Prod {
            return;
        }
        match self.runtime.clone().filter(Connection::is_open) {
            Some(runtime) => {
                let forwarded = envelope.with_extra("prodId", serde_json::json!(sender.id));
                self.send_envelope(&runtime, &forwarded).await;
            },
            None => {
                let error_envelope = Envelope::error(
                    "no runtime connected",
                    envelope.request_id.clone(),
                    Some(self.project_id.to_string()),
                    now_ms(),
                );
                self.send_envelope(&sender, &error_envelope).await;
            },
        }
    }

    /// `prod_ui_response`: runtime → the prod named by `prodId`.
    async fn handle_prod_ui_response(&mut self, envelope: Envelope) {
        let Some(prod_id) = envelope.prod_id.clone() else {
            return;
        };
        if let Some(prod) = self.prods.get(&prod_id).cloned()
            && prod.is_open()
        {
            self.send_envelope(&prod, &envelope).await;
        }
        // prod already disconnected: drop silently, per spec.md §4.4.
    }

    /// `check_agents`: synchronous, read-only, restricted to OPEN agents.
    async fn handle_check_agents(&mut self, sender: Connection, envelope: Envelope) {
        self.prune_stale_agents();

        let agents: Vec<_> = self
            .agents
            .values()
            .map(|agent| {
                serde_json::json!({
                    "id": agent.id,
                    "connectedAt": agent.connected_at.timestamp_millis(),
                    "projectId": self.project_id.as_ref(),
                })
            })
            .collect();

        let mut response = Envelope::new(message_type::AGENT_STATUS_RESPONSE, now_ms());
        response.request_id = envelope.request_id;
        response.project_id = Some(self.project_id.to_string());
        response = response.with_extra("agents", serde_json::Value::Array(agents));
        self.send_envelope(&sender, &response).await;
    }

    async fn handle_ping(&mut self, sender: Connection, envelope: Envelope) {
        let mut pong = Envelope::pong(now_ms());
        pong.request_id = envelope.request_id;
        self.send_envelope(&sender, &pong).await;
    }

    // ── Pending-request table ────────────────────────────────────────────

    fn schedule_pending(&mut self, request_id: String, runtime_id: String, kind: PendingKind) {
        let tx = self.self_tx.clone();
        let timeout_request_id = request_id.clone();
        let timeout_duration = self.request_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout_duration).await;
            let _ = tx.send(RoomCommand::RequestTimeout {
                request_id: timeout_request_id,
            });
        });

        let created_at = now_ms();
        let previous = self.pending.insert(
            request_id.clone(),
            PendingRequest::new(request_id, runtime_id, created_at, kind, handle),
        );
        if let Some(stale) = previous {
            stale.cancel();
        }
    }

    async fn handle_request_timeout(&mut self, request_id: String) {
        let Some(pending) = self.pending.remove(&request_id) else {
            return;
        };
        let runtime_id = pending.runtime_id.clone();
        pending.cancel();

        if let Some(runtime) = self.runtime.clone().filter(|r| r.id == runtime_id) {
            let timeout_ms = self.request_timeout.as_millis();
            let error_envelope = Envelope::error(
                format!("timeout after {timeout_ms}ms"),
                Some(request_id),
                Some(self.project_id.to_string()),
                now_ms(),
            );
            self.send_envelope(&runtime, &error_envelope).await;
        }
    }

    fn cancel_pending_for_runtime(&mut self, runtime_id: &str) {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.runtime_id == runtime_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(pending) = self.pending.remove(&id) {
                pending.cancel();
            }
        }
    }

    // ── Admin fan-out (spec.md §4.6) ─────────────────────────────────────

    async fn fan_out_to_admins(&mut self, sender_id: &str, envelope: &Envelope) {
        self.prune_stale_admins();
        let forwarded_at = now_ms();

        for (admin_id, admin) in &self.admins {
            if admin_id == sender_id || !admin.is_open() {
                continue;
            }
            let decorated = envelope.clone().with_extra(
                "_meta",
                serde_json::json!({
                    "from": sender_id,
                    "projectId": self.project_id.as_ref(),
                    "forwardedAt": forwarded_at,
                }),
            );
            if let Err(err) = admin.socket.send(serde_json::to_string(&decorated).unwrap_or_default()).await {
                debug!(project_id = %self.project_id, admin_id = %admin_id, error = %err, "admin fan-out send failed");
            }
        }
    }

    // ── Logging & usage ──────────────────────────────────────────────────

    async fn store_log(&self, envelope: &Envelope, direction: Direction, peer: Option<&Connection>) {
        let envelope_value = match serde_json::to_value(envelope) {
            Ok(value) => value,
            Err(_) => return,
        };
        let entry = NewLog {
            project_id: &self.project_id,
            timestamp: envelope.timestamp,
            message_type: &envelope.r#type,
            direction,
            envelope: &envelope_value,
            client_id: peer.map(|p| p.id.as_str()),
            client_role: peer.map(|p| p.role.as_str()),
            from_client_id: None,
        };
        if let Err(err) = self.log_store.append(entry).await {
            warn!(project_id = %self.project_id, error = %err, "failed to append log entry");
        }
    }

    async fn record_usage(&self) {
        let now = Utc::now();
        if let Err(err) = self.usage_store.record(&self.project_id, &day_key(now)).await {
            warn!(project_id = %self.project_id, error = %err, "failed to record usage");
        }
    }

    // ── Idle alarm (spec.md §4.9) ────────────────────────────────────────

    fn touch_activity(&mut self) {
        self.last_activity = Utc::now();
        self.reschedule_idle_alarm();
    }

    fn is_idle(&self) -> bool {
        self.runtime.is_none() && self.agents.is_empty()
    }

    fn reschedule_idle_alarm(&mut self) {
        self.idle_generation += 1;
        if !self.is_idle() {
            return;
        }
        let generation = self.idle_generation;
        let tx = self.self_tx.clone();
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let _ = tx.send(RoomCommand::IdleAlarm { generation });
        });
    }

    /// Returns `true` if the Room should stop running after this alarm.
    async fn handle_idle_alarm(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }
        info!(project_id = %self.project_id, "idle alarm fired, suspending room");
        self.cancel_all_pending();
        if let Err(err) = self.log_store.compact(Utc::now()).await {
            warn!(project_id = %self.project_id, error = %err, "log retention compaction failed");
        }
        true
    }

    fn cancel_all_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel();
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_all_pending();
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn find_connection(&self, conn_id: &str) -> Option<Connection> {
        if let Some(runtime) = &self.runtime
            && runtime.id == conn_id
        {
            return Some(runtime.clone());
        }
        self.agents
            .get(conn_id)
            .or_else(|| self.prods.get(conn_id))
            .or_else(|| self.admins.get(conn_id))
            .cloned()
    }

    fn first_open_agent(&mut self) -> Option<Connection> {
        self.prune_stale_agents();
        self.agents.values().find(|a| a.is_open()).cloned()
    }

    fn prune_stale_agents(&mut self) {
        self.agents.retain(|_, conn| conn.is_open());
    }

    fn prune_stale_admins(&mut self) {
        self.admins.retain(|_, conn| conn.is_open());
    }

    async fn send_envelope(&self, conn: &Connection, envelope: &Envelope) {
        if !conn.is_open() {
            return;
        }
        let Ok(text) = serde_json::to_string(envelope) else {
            return;
        };
        if let Err(err) = conn.socket.send(text).await {
            debug!(project_id = %self.project_id, client_id = %conn.id, error = %err, "send failed");
        }
    }
}

fn query_text_of(envelope: &Envelope) -> String {
    envelope
        .query
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

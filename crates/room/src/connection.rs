use std::sync::Arc;

use chrono::{DateTime, Utc};
use roombus_protocol::Role;

use crate::socket::{SocketHandle, SocketState};

#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

/// A single admitted client socket. Owned exclusively by the Room that
/// admitted it, never shared or mutated from outside the Room's own
/// command loop (spec.md §3 invariant: every Connection's `projectId`
/// equals its owning Room's id).
#[derive(Clone)]
pub struct Connection {
    pub id: String,
    pub role: Role,
    pub project_id: Arc<str>,
    pub socket: Arc<dyn SocketHandle>,
    pub connected_at: DateTime<Utc>,
    pub metadata: ConnectionMetadata,
}

impl Connection {
    pub fn is_open(&self) -> bool {
        self.socket.state() == SocketState::Open
    }
}

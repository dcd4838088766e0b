//! Wire protocol for the room bus.
//!
//! All communication uses JSON frames over WebSocket. Every frame is an
//! [`Envelope`]: a fixed set of routing fields (`type`, `timestamp`, and the
//! handful of correlation ids the routing engine inspects) plus whatever
//! payload fields a given message `type` carries, preserved verbatim via
//! `#[serde(flatten)]` so the Room can forward an inbound envelope to another
//! client with one or two fields added, without needing to know its full
//! shape up front.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// How long a runtime-issued request waits for a reply before it is
/// synthesized as a timeout error.
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// How long a Room waits, once idle (no runtime, no agents), before its
/// alarm fires and it cancels outstanding work and may suspend.
pub const IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Newest-first cap on entries retained in a single hourly log bucket.
pub const MAX_LOGS_PER_HOUR: usize = 1000;

/// How many hours of log buckets are retained before compaction deletes them.
pub const LOG_RETENTION_HOURS: i64 = 24;

/// Cap on the number of historical log entries replayed to a newly
/// connected admin observer.
pub const HISTORICAL_LOGS_LIMIT: usize = 500;

/// `projectId` must match this pattern.
pub const PROJECT_ID_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

/// Hand-rolled equivalent of [`PROJECT_ID_PATTERN`], short enough that a
/// regex engine would be overkill for the one caller (the Front Router's
/// admission check).
pub fn is_valid_project_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Length, in characters, of the non-secret key prefix stored alongside a
/// hashed API key.
pub const API_KEY_PREFIX_LEN: usize = 12;

/// Number of cryptographically random bytes used to derive a plaintext API key.
pub const API_KEY_RANDOM_BYTES: usize = 16;

/// Projects that are allowed to connect without an API key.
pub const DEFAULT_BYPASS_PROJECTS: &[&str] = &["demo", "demo-prod"];

/// Close code used when a runtime upgrade attempt violates the singleton rule
/// or requests an invalid role.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_NORMAL: u16 = 1000;

// ── Message type tags ────────────────────────────────────────────────────────

pub mod message_type {
    pub const CONNECTED: &str = "connected";
    pub const GRAPHQL_QUERY: &str = "graphql_query";
    pub const QUERY_RESPONSE: &str = "query_response";
    pub const GET_DOCS: &str = "get_docs";
    pub const DOCS: &str = "docs";
    pub const GET_PROD_UI: &str = "get_prod_ui";
    pub const PROD_UI_RESPONSE: &str = "prod_ui_response";
    pub const CHECK_AGENTS: &str = "check_agents";
    pub const AGENT_STATUS_RESPONSE: &str = "agent_status_response";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const HISTORICAL_LOGS: &str = "historical_logs";
}

// ── Roles ────────────────────────────────────────────────────────────────────

/// The four client roles a Room admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Runtime,
    Agent,
    Prod,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Runtime => "runtime",
            Role::Agent => "agent",
            Role::Prod => "prod",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "runtime" => Some(Role::Runtime),
            "agent" => Some(Role::Agent),
            "prod" => Some(Role::Prod),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub const ALL: [Role; 4] = [Role::Runtime, Role::Agent, Role::Prod, Role::Admin];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The JSON object exchanged on the wire. `type` and `timestamp` are always
/// present; the rest are populated per message kind (see spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: String,
    pub timestamp: i64,

    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(rename = "runtimeId", skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,

    #[serde(rename = "prodId", skip_serializing_if = "Option::is_none")]
    pub prod_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Any other field the message kind carries (e.g. `clientId`,
    /// `clientType`, `count`, `logs`, `agents`). Preserved verbatim on
    /// forward so the Room never has to know every message shape.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn new(r#type: impl Into<String>, timestamp: i64) -> Self {
        Self {
            r#type: r#type.into(),
            timestamp,
            request_id: None,
            project_id: None,
            runtime_id: None,
            prod_id: None,
            query: None,
            variables: None,
            data: None,
            error: None,
            message: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Build the `error` envelope the routing engine sends back to a sender.
    pub fn error(
        message: impl Into<String>,
        request_id: Option<String>,
        project_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        let mut env = Self::new(message_type::ERROR, timestamp);
        env.message = Some(message.into());
        env.request_id = request_id;
        env.project_id = project_id;
        env
    }

    pub fn pong(timestamp: i64) -> Self {
        Self::new(message_type::PONG, timestamp)
    }

    /// Insert/overwrite a field in the `extra` bag (used e.g. to annotate a
    /// forwarded `graphql_query` with `runtimeId`, or a `get_prod_ui` with
    /// `prodId`).
    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// `true` if this is an `error` envelope, used by the self-loop guard
    /// (never emit an `error` in direct response to an inbound `error`).
    pub fn is_error(&self) -> bool {
        self.r#type == message_type::ERROR
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("bogus"), None);
    }

    #[test]
    fn envelope_preserves_unknown_fields_on_round_trip() {
        let json = serde_json::json!({
            "type": "graphql_query",
            "timestamp": 1000,
            "requestId": "q1",
            "projectId": "P",
            "query": "{ ping }",
        });
        let mut env: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.request_id.as_deref(), Some("q1"));

        env = env.with_extra("runtimeId", serde_json::json!("r0"));
        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["runtimeId"], serde_json::json!("r0"));
        assert_eq!(out["query"], serde_json::json!("{ ping }"));
    }

    #[test]
    fn project_id_validation_matches_the_documented_pattern() {
        assert!(is_valid_project_id("demo"));
        assert!(is_valid_project_id("Acme-Corp_42"));
        assert!(!is_valid_project_id(""));
        assert!(!is_valid_project_id("has a space"));
        assert!(!is_valid_project_id(&"x".repeat(65)));
    }

    #[test]
    fn error_envelope_is_flagged_for_loop_guard() {
        let env = Envelope::error("boom", Some("q1".into()), Some("P".into()), 1);
        assert!(env.is_error());
        assert_eq!(env.message.as_deref(), Some("boom"));
    }
}

//! Process-wide gateway state: the Room registry plus the shared
//! collaborators every Room is spawned with.

use std::sync::Arc;

use dashmap::DashMap;
use roombus_config::Config;
use roombus_credentials::ApiKeyStore;
use roombus_room::{LogBucketStore, RoomHandle, UsageCounterStore};

use crate::throttle::RequestThrottle;

/// Shared application state, cloned (cheaply, via `Arc` fields) into every
/// axum handler. Holds no per-connection state; that lives entirely
/// inside each spawned [`RoomHandle`]'s task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomRegistry>,
    pub api_keys: Arc<ApiKeyStore>,
    pub log_store: Arc<dyn LogBucketStore>,
    pub usage_store: Arc<dyn UsageCounterStore>,
    pub throttle: Arc<RequestThrottle>,
}

/// Maps `projectId` to its live [`RoomHandle`], spawning one on first use.
/// A Room, once spawned, never moves to a different registry entry; it is
/// only ever replaced if it has fully shut down (spec.md §3 lifecycle).
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    log_store: Arc<dyn LogBucketStore>,
    usage_store: Arc<dyn UsageCounterStore>,
    idle_timeout: std::time::Duration,
    request_timeout: std::time::Duration,
}

impl RoomRegistry {
    pub fn new(
        log_store: Arc<dyn LogBucketStore>,
        usage_store: Arc<dyn UsageCounterStore>,
        idle_timeout: std::time::Duration,
        request_timeout: std::time::Duration,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            log_store,
            usage_store,
            idle_timeout,
            request_timeout,
        }
    }

    /// Return the live Room for `project_id`, spawning a fresh one if none
    /// exists or the existing one has shut down.
    pub fn get_or_spawn(&self, project_id: &str) -> RoomHandle {
        if let Some(existing) = self.rooms.get(project_id)
            && !existing.is_closed()
        {
            return existing.clone();
        }

        let handle = roombus_room::spawn(
            project_id,
            self.log_store.clone(),
            self.usage_store.clone(),
            self.idle_timeout,
            self.request_timeout,
        );
        self.rooms.insert(project_id.to_string(), handle.clone());
        handle
    }

    /// A non-spawning lookup, used by read-only endpoints (`/status`,
    /// `/usage`) that should not resurrect a hibernated Room just to
    /// report it as empty.
    pub fn get(&self, project_id: &str) -> Option<RoomHandle> {
        self.rooms.get(project_id).map(|entry| entry.clone())
    }
}

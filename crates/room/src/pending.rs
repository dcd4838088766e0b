use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Query,
    Docs,
}

/// A correlation record between a runtime-issued request and its eventual
/// reply. Owns exactly one cancellable timeout task; every removal path
/// (reply, timeout fire, runtime disconnect, room shutdown) must abort it
/// exactly once (spec.md §5).
pub struct PendingRequest {
    pub request_id: String,
    pub runtime_id: String,
    pub created_at: i64,
    pub kind: PendingKind,
    timeout: JoinHandle<()>,
}

impl PendingRequest {
    pub fn new(
        request_id: String,
        runtime_id: String,
        created_at: i64,
        kind: PendingKind,
        timeout: JoinHandle<()>,
    ) -> Self {
        Self {
            request_id,
            runtime_id,
            created_at,
            kind,
            timeout,
        }
    }

    /// Cancel the scheduled timeout. Consumes `self` so it can only ever
    /// be called once per pending entry.
    pub fn cancel(self) {
        self.timeout.abort();
    }
}

//! Per-project Room actors: the serialized executor that owns a project's
//! connections, pending-request table, idle alarm, log bucket store, and
//! usage counters (spec.md §3-§5). A front router (`roombus-gateway`)
//! looks up or spawns a [`RoomHandle`] per project id and hands it
//! admitted sockets; everything past that point runs on the Room's own
//! task.

pub mod connection;
pub mod error;
pub mod fixture;
pub mod log_store;
pub mod pending;
pub mod room;
pub mod socket;
pub mod usage;

pub use connection::{Connection, ConnectionMetadata};
pub use error::{Error, Result};
pub use log_store::{Direction, HistoricalReplay, LogBucketStore, NewLog, SqliteLogBucketStore, hour_key};
pub use pending::{PendingKind, PendingRequest};
pub use room::{ConnectOutcome, RoomHandle, RoomStatus, spawn};
pub use socket::{SocketHandle, SocketState};
pub use usage::{DailyCount, SqliteUsageCounterStore, UsageCounterStore, UsageReport, day_key};

#[cfg(any(test, feature = "test-util"))]
pub use socket::mock::MockSocket;

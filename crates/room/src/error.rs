//! Room-internal error type. Nothing here is allowed to unwind across the
//! `RoomCommand` loop; callers convert these into `error` envelopes or
//! log lines, never into a panic (spec.md §7: "nothing is fatal at the
//! Room level").

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket is not open")]
    SocketNotOpen,

    #[error("room actor has already shut down")]
    RoomGone,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

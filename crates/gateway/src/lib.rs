//! The Front Router (spec.md §4.1): a single process-wide axum app that
//! admits connections, looks up or spawns the project's [`roombus_room`]
//! actor, and otherwise gets out of the way, message routing happens
//! entirely inside the Room.

pub mod error;
pub mod router;
pub mod server;
pub mod state;
pub mod throttle;
pub mod ws;

pub use error::Error;
pub use server::{ServerConfig, build_gateway_app};
pub use state::AppState;

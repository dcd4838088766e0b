//! Transport abstraction. Production wiring hands the Room an
//! `Arc<dyn SocketHandle>` backed by an axum `WebSocket`; tests hand it a
//! `MockSocket`. The Room never knows which one it has (spec.md §1: the
//! transport framing is an external collaborator).

use async_trait::async_trait;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[async_trait]
pub trait SocketHandle: Send + Sync {
    /// Send one JSON-serialized frame. Returns an error only when the
    /// transport itself reports failure; callers are expected to check
    /// [`SocketHandle::state`] before sending to avoid needless attempts
    /// on a peer already known to be gone.
    async fn send(&self, text: String) -> Result<(), Error>;

    fn state(&self) -> SocketState;

    async fn close(&self, code: u16);
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::sync::Mutex;

    use super::{SocketHandle, SocketState};
    use crate::error::Error;
    use async_trait::async_trait;

    /// An in-memory socket that records every frame sent to it. Used by
    /// `roombus-room`'s own tests and importable by `roombus-gateway`'s
    /// integration tests that want to drive a Room without a live socket.
    pub struct MockSocket {
        state: Mutex<SocketState>,
        sent: Mutex<Vec<String>>,
    }

    impl MockSocket {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(SocketState::Open),
                sent: Mutex::new(Vec::new()),
            }
        }

        #[allow(clippy::unwrap_used)]
        pub fn set_state(&self, state: SocketState) {
            *self.state.lock().unwrap() = state;
        }

        #[allow(clippy::unwrap_used)]
        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        #[allow(clippy::unwrap_used)]
        pub fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|frame| serde_json::from_str(frame).ok())
                .collect()
        }
    }

    #[async_trait]
    impl SocketHandle for MockSocket {
        #[allow(clippy::unwrap_used)]
        async fn send(&self, text: String) -> Result<(), Error> {
            if *self.state.lock().unwrap() != SocketState::Open {
                return Err(Error::SocketNotOpen);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        #[allow(clippy::unwrap_used)]
        fn state(&self) -> SocketState {
            *self.state.lock().unwrap()
        }

        async fn close(&self, _code: u16) {
            self.set_state(SocketState::Closed);
        }
    }
}

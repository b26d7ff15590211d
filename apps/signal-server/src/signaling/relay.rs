//! Relay hub for dispatching frames to connected clients.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connection
//! subscribes and filters envelopes locally by its current room, which is
//! all a single-process signaling deployment needs.

use std::sync::Arc;

use tokio::sync::broadcast;

use subvox_common::protocol::ServerFrame;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const RELAY_CAPACITY: usize = 4096;

/// A frame addressed to the members of one room.
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    /// The room whose members should receive the frame.
    pub room: String,
    /// A user id to skip, for notifications that exclude their subject.
    pub exclude_user: Option<String>,
    pub frame: ServerFrame,
}

/// The global relay hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct RelayHub {
    sender: broadcast::Sender<Arc<RelayEnvelope>>,
}

impl RelayHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(RELAY_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the relay channel. Each connection calls this once to
    /// get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RelayEnvelope>> {
        self.sender.subscribe()
    }

    /// Dispatch an envelope to all subscribed connections.
    pub fn dispatch(&self, envelope: RelayEnvelope) {
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(envelope));
    }
}

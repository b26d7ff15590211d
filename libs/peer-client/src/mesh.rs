//! Live table of direct peer connections, keyed by remote user id.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::PeerError;
use crate::transport::PeerLink;

/// Challenge progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStage {
    /// Dialed or accepted, waiting for the channel to open.
    Connecting,
    /// Channel open, no challenge exchanged yet.
    Open,
    /// Join-code request sent, awaiting the answer.
    ChallengePending,
    /// Challenge passed; application payloads flow.
    Validated,
    /// Challenge failed. The connection stays open but its payloads are
    /// dropped.
    Rejected,
}

struct MeshEntry {
    link: Box<dyn PeerLink>,
    stage: LinkStage,
}

/// At most one entry per remote peer; repeat dials are ignored.
#[derive(Default)]
pub struct PeerMesh {
    entries: HashMap<String, MeshEntry>,
}

impl PeerMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection in the given stage. Returns `false` and leaves
    /// the existing entry untouched when the peer is already present.
    pub fn insert(&mut self, peer: &str, link: Box<dyn PeerLink>, stage: LinkStage) -> bool {
        if self.entries.contains_key(peer) {
            return false;
        }
        self.entries
            .insert(peer.to_string(), MeshEntry { link, stage });
        true
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stage(&self, peer: &str) -> Option<LinkStage> {
        self.entries.get(peer).map(|entry| entry.stage)
    }

    /// Move a connection to a new stage. No-op for unknown peers.
    pub fn set_stage(&mut self, peer: &str, stage: LinkStage) {
        if let Some(entry) = self.entries.get_mut(peer) {
            entry.stage = stage;
        }
    }

    /// Send to one peer.
    pub fn send_to(&self, peer: &str, data: Value) -> Result<(), PeerError> {
        match self.entries.get(peer) {
            Some(entry) => entry.link.send(data),
            None => Err(PeerError::UnknownPeer(peer.to_string())),
        }
    }

    /// Best-effort send to every entry; links that refuse are skipped.
    pub fn send_to_all(&self, data: &Value) {
        for (peer, entry) in &self.entries {
            if entry.link.send(data.clone()).is_err() {
                debug!(%peer, "skipping closed connection");
            }
        }
    }

    /// Ask one link to close. The entry stays until the close is
    /// acknowledged by the transport.
    pub fn close(&self, peer: &str) {
        if let Some(entry) = self.entries.get(peer) {
            entry.link.close();
        }
    }

    /// Drop an entry. Returns `true` if the peer was present.
    pub fn remove(&mut self, peer: &str) -> bool {
        self.entries.remove(peer).is_some()
    }

    /// Close every link and clear the table immediately.
    pub fn close_all(&mut self) {
        for entry in self.entries.values() {
            entry.link.close();
        }
        self.entries.clear();
    }
}

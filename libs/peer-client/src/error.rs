//! Errors surfaced by session-client operations.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// No live mesh entry exists for the addressed peer.
    #[error("connection {0} not found")]
    UnknownPeer(String),

    /// The signaling server has not assigned an identity yet.
    #[error("Must obtain ID from socket server")]
    MissingIdentity,

    /// A peer-facing operation ran before the peer endpoint was opened.
    #[error("Cannot connect to peer - peer server connection not established")]
    EndpointMissing,

    /// Endpoint teardown was requested while no endpoint existed.
    #[error("Peer not connected")]
    EndpointNotConnected,

    /// Ending a broadcast requires a cached room id.
    #[error("No room defined for broadcast")]
    NoActiveRoom,

    /// A one-shot operation hit its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The underlying transport reported a failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The retry budget for the peer-server link is exhausted.
    #[error("Reconnect timed out")]
    ReconnectTimedOut,

    /// The coordinator task is no longer running.
    #[error("session coordinator stopped")]
    CoordinatorStopped,
}

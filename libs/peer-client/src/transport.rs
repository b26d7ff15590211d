//! Transport seams: the signaling channel and the direct-connection
//! provider. The concrete socket and peer stacks live behind these traits
//! so the coordinator can be driven by fakes in tests.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use subvox_common::protocol::{ClientFrame, ServerFrame};

use crate::error::PeerError;

// ---------------------------------------------------------------------------
// Signaling channel
// ---------------------------------------------------------------------------

/// Events emitted by the signaling transport.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Error(String),
    Frame(ServerFrame),
}

/// Dials signaling channels.
///
/// Transport-level redialing (the automatic retry loop most socket stacks
/// ship with) is the connector's concern; the coordinator only reacts to
/// the events it emits.
#[async_trait]
pub trait SignalConnector: Send + Sync {
    /// Open a channel. Lifecycle and inbound frames flow through `events`
    /// until the returned handle is dropped.
    async fn connect(
        &self,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<Box<dyn SignalSocket>, PeerError>;
}

/// Command handle for one signaling channel. Dropping it releases the
/// channel.
pub trait SignalSocket: Send + Sync {
    /// Queue a frame for delivery. Fire-and-forget; transport failures come
    /// back as [`SocketEvent::Error`].
    fn send(&self, frame: ClientFrame) -> Result<(), PeerError>;

    /// Request a graceful close, answered by [`SocketEvent::Disconnected`].
    fn close(&self);
}

// ---------------------------------------------------------------------------
// Direct connections
// ---------------------------------------------------------------------------

/// Events emitted by the direct-connection provider. Connection-scoped
/// events carry the remote peer's user id.
pub enum LinkEvent {
    /// Our endpoint registration is live; peers can dial us now.
    EndpointOpen,
    /// The registration dropped but can be resumed in place.
    EndpointDisconnected,
    EndpointError(String),
    /// A remote peer dialed us.
    IncomingConnection { peer: String, link: Box<dyn PeerLink> },
    /// An outgoing or incoming connection finished opening.
    ConnectionOpen { peer: String },
    ConnectionData { peer: String, data: Value },
    ConnectionClosed { peer: String },
}

/// Registers peer endpoints with the relay infrastructure.
#[async_trait]
pub trait DirectProvider: Send + Sync {
    /// Register an endpoint under `user_id`. Endpoint and connection events
    /// flow through `events` for the endpoint's lifetime.
    async fn open_endpoint(
        &self,
        user_id: &str,
        events: UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn PeerEndpoint>, PeerError>;
}

/// The endpoint registered under our own user id.
pub trait PeerEndpoint: Send + Sync {
    /// Dial a peer. Progress arrives as `ConnectionOpen` and
    /// `ConnectionClosed` events for that peer.
    fn connect(&self, peer: &str) -> Result<Box<dyn PeerLink>, PeerError>;

    /// Resume a dropped registration in place.
    fn reconnect(&self);

    /// Tear the endpoint down, answered by [`LinkEvent::EndpointDisconnected`].
    fn destroy(&self);
}

/// A live data channel to one peer.
pub trait PeerLink: Send + Sync {
    /// Queue a payload on the channel.
    fn send(&self, data: Value) -> Result<(), PeerError>;

    /// Ask the transport to close, answered by [`LinkEvent::ConnectionClosed`].
    fn close(&self);
}

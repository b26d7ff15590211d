//! Wire formats for the signaling channel and the direct-connection
//! challenge handshake, shared by server and client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client → Server frames
// ---------------------------------------------------------------------------

/// A frame sent from a client to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: ClientEvent,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ClientFrame {
    /// Build a `setId` frame. `id` carries a previously-issued identity on
    /// reconnect; `None` asks the server to allocate one.
    pub fn set_id(id: Option<String>) -> Self {
        Self {
            event: ClientEvent::SetId,
            data: serde_json::to_value(SetIdPayload { id }).unwrap(),
        }
    }

    /// Build a `join` frame. `room: None` asks the server to mint a room.
    pub fn join(room: Option<String>, my_broadcast: bool) -> Self {
        Self {
            event: ClientEvent::Join,
            data: serde_json::to_value(JoinPayload {
                room,
                my_broadcast: Some(my_broadcast),
            })
            .unwrap(),
        }
    }

    /// Build a generic relay frame addressed to a room.
    pub fn relay(payload: RelayPayload) -> Self {
        Self {
            event: ClientEvent::Message,
            data: serde_json::to_value(payload).unwrap(),
        }
    }

    /// Build an `endBroadcast` frame for the given room.
    pub fn end_broadcast(room: &str) -> Self {
        Self {
            event: ClientEvent::EndBroadcast,
            data: serde_json::to_value(EndBroadcastPayload {
                room: room.to_string(),
            })
            .unwrap(),
        }
    }
}

/// Client frame kinds. Unrecognized kinds parse to [`ClientEvent::Unknown`]
/// so the server can warn and move on instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientEvent {
    SetId,
    Join,
    Message,
    EndBroadcast,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Client → Server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetIdPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(
        rename = "myBroadcast",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub my_broadcast: Option<bool>,
}

/// Payload of a generic relay frame. All three fields are required; a relay
/// request missing any of them is ignored with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
    pub user: String,
    pub message: Value,
    pub room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndBroadcastPayload {
    pub room: String,
}

// ---------------------------------------------------------------------------
// Server → Client frames
// ---------------------------------------------------------------------------

/// A frame sent from the signaling server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: ServerEvent,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ServerFrame {
    /// Build a `message` frame carrying a control payload.
    pub fn control(message: &ControlMessage) -> Self {
        Self {
            event: ServerEvent::Message,
            data: serde_json::to_value(message).unwrap(),
        }
    }

    /// Build a `newMessage` frame relaying an application payload to a room.
    pub fn relay(user: &str, message: Value) -> Self {
        Self {
            event: ServerEvent::NewMessage,
            data: serde_json::to_value(RoomMessage {
                user: user.to_string(),
                message,
            })
            .unwrap(),
        }
    }

    /// Build the bare `endBroadcast` signal.
    pub fn end_broadcast() -> Self {
        Self {
            event: ServerEvent::EndBroadcast,
            data: Value::Null,
        }
    }
}

/// Server frame kinds. Unrecognized kinds parse to [`ServerEvent::Unknown`]
/// and are surfaced to the application as unhandled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerEvent {
    Message,
    NewMessage,
    EndBroadcast,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Server → Client control payloads
// ---------------------------------------------------------------------------

/// Control payloads carried inside a `message` frame, tagged by their
/// `message` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum ControlMessage {
    /// The server allocated (or accepted) an identity for this connection.
    #[serde(rename = "set user id")]
    SetUserId { id: String },
    /// Join acknowledgment carrying the effective room id.
    #[serde(rename = "room joined")]
    RoomJoined { room: String, user: String },
    /// Broadcaster-only member list for fanning out direct connections.
    #[serde(rename = "connect clients")]
    ConnectClients { clients: Vec<String> },
    /// A new member joined the room.
    #[serde(rename = "user joined room")]
    UserJoined {
        user: String,
        room: String,
        #[serde(rename = "isHost", default)]
        is_host: bool,
    },
    /// A member's signaling channel closed.
    #[serde(rename = "user left room")]
    UserLeft { user: String, room: String },
}

/// A relayed application payload as delivered to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub user: String,
    pub message: Value,
}

// ---------------------------------------------------------------------------
// Direct-connection handshake payloads
// ---------------------------------------------------------------------------

/// Join-code challenge messages exchanged over a direct connection. Any
/// payload that does not parse as one of these is an opaque application
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeFrame {
    Request(ChallengeRequest),
    Verdict(ChallengeVerdict),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum ChallengeRequest {
    /// Broadcaster asks a freshly connected peer for its join code.
    JoinCode,
    /// Peer answers with the code it holds, if any.
    ValidateJoinCode {
        #[serde(rename = "joinCode", default, skip_serializing_if = "Option::is_none")]
        join_code: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase")]
pub enum ChallengeVerdict {
    Valid,
    Invalid,
}

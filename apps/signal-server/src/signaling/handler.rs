//! Inbound frame processing: setId, join, generic relay, and endBroadcast.

use serde_json::Value;

use subvox_common::code::generate_room_id;
use subvox_common::id::{prefix, prefixed_ulid};
use subvox_common::protocol::{
    ControlMessage, EndBroadcastPayload, JoinPayload, RelayPayload, ServerFrame, SetIdPayload,
};

use super::registry::RoomRegistry;
use super::relay::{RelayEnvelope, RelayHub};

/// Process a `setId` frame. A provided id is re-associated with this
/// connection (reconnect case); otherwise a fresh one is allocated. The
/// effective id is echoed back either way.
pub fn handle_set_id(
    registry: &RoomRegistry,
    conn_id: &str,
    payload: SetIdPayload,
) -> ServerFrame {
    let user_id = match payload.id.filter(|id| !id.is_empty()) {
        Some(id) => {
            tracing::debug!(%conn_id, user_id = %id, "user id received");
            id
        }
        None => {
            let id = prefixed_ulid(prefix::USER);
            tracing::debug!(%conn_id, user_id = %id, "user id generated");
            id
        }
    };
    registry.set_user_id(conn_id, &user_id);
    ServerFrame::control(&ControlMessage::SetUserId { id: user_id })
}

/// Process a `join` frame. Returns the replies for the caller, in order;
/// listener joins additionally notify the rest of the room through the hub.
pub fn handle_join(
    registry: &RoomRegistry,
    hub: &RelayHub,
    conn_id: &str,
    payload: JoinPayload,
) -> Vec<ServerFrame> {
    let mut replies = Vec::new();

    // A join before setId allocates the identity on the spot, and the
    // caller learns it before the join replies.
    let user_id = match registry.user_id(conn_id) {
        Some(id) => id,
        None => {
            let id = prefixed_ulid(prefix::USER);
            registry.set_user_id(conn_id, &id);
            replies.push(ServerFrame::control(&ControlMessage::SetUserId {
                id: id.clone(),
            }));
            id
        }
    };

    let my_broadcast = payload.my_broadcast.unwrap_or(false);
    let room = payload
        .room
        .filter(|room| !room.is_empty())
        .unwrap_or_else(generate_room_id);

    let others = registry.join(conn_id, &room, &user_id);
    tracing::info!(
        user_id = %user_id,
        room = %room,
        role = if my_broadcast { "host" } else { "listener" },
        "joined room"
    );

    if my_broadcast {
        // The broadcaster fans out direct connections to everyone already
        // in the room.
        replies.push(ServerFrame::control(&ControlMessage::ConnectClients {
            clients: others,
        }));
    } else {
        hub.dispatch(RelayEnvelope {
            room: room.clone(),
            exclude_user: Some(user_id.clone()),
            frame: ServerFrame::control(&ControlMessage::UserJoined {
                user: user_id.clone(),
                room: room.clone(),
                is_host: my_broadcast,
            }),
        });
    }

    replies.push(ServerFrame::control(&ControlMessage::RoomJoined {
        room,
        user: user_id,
    }));
    replies
}

/// Process a generic relay frame: fan the payload out to every member of
/// the addressed room, the sender included. Payloads missing a required
/// field are ignored with a warning.
pub fn handle_relay(hub: &RelayHub, conn_id: &str, data: Value) {
    let payload: RelayPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(_) => {
            tracing::warn!(%conn_id, "unhandled relay payload");
            return;
        }
    };
    hub.dispatch(RelayEnvelope {
        room: payload.room,
        exclude_user: None,
        frame: ServerFrame::relay(&payload.user, payload.message),
    });
}

/// Process an `endBroadcast` frame: signal every member of the room, the
/// requester included, then mark the room ended so connection teardown can
/// reap it.
pub fn handle_end_broadcast(
    registry: &RoomRegistry,
    hub: &RelayHub,
    conn_id: &str,
    data: Value,
) {
    let payload: EndBroadcastPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(_) => {
            tracing::warn!(%conn_id, "endBroadcast without a room");
            return;
        }
    };
    tracing::info!(room = %payload.room, "broadcast ended");
    hub.dispatch(RelayEnvelope {
        room: payload.room.clone(),
        exclude_user: None,
        frame: ServerFrame::end_broadcast(),
    });
    registry.mark_ended(&payload.room);
}

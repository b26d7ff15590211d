//! WebSocket upgrade handler and per-connection event loop.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use subvox_common::protocol::{
    ClientEvent, ClientFrame, ControlMessage, JoinPayload, ServerFrame, SetIdPayload,
};

use crate::AppState;

use super::handler::{handle_end_broadcast, handle_join, handle_relay, handle_set_id};
use super::relay::RelayEnvelope;

pub fn router() -> Router<AppState> {
    Router::new().route("/signal", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection event loop: process client frames and forward relay
/// envelopes addressed to this connection's room.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before the connection can join anything so no envelope for
    // its future room is missed.
    let mut relay_rx = state.relay.subscribe();
    let conn_id = state.registry.register_connection();
    tracing::info!(%conn_id, "client connected");

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(_) => {
                                tracing::warn!(%conn_id, "invalid frame json");
                                continue;
                            }
                        };
                        if !process_frame(&state, &mut ws_tx, &conn_id, frame).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, %conn_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Envelope from the relay hub.
            result = relay_rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if !addressed_to(&state, &conn_id, &envelope) {
                            continue;
                        }
                        if !send_frame(&mut ws_tx, &envelope.frame).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%conn_id, skipped = n, "connection lagged behind relay");
                        // Continue — we just drop the missed envelopes.
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Implicit leave, processed exactly once per connection.
    if let Some((user_id, room)) = state.registry.disconnect(&conn_id) {
        state.relay.dispatch(RelayEnvelope {
            room: room.clone(),
            exclude_user: Some(user_id.clone()),
            frame: ServerFrame::control(&ControlMessage::UserLeft {
                user: user_id.clone(),
                room,
            }),
        });
        tracing::info!(%conn_id, user_id = %user_id, "client disconnected");
    } else {
        tracing::info!(%conn_id, "client disconnected");
    }
}

/// Whether an envelope should be delivered to this connection: it must be
/// in the addressed room and not the excluded user.
fn addressed_to(state: &AppState, conn_id: &str, envelope: &RelayEnvelope) -> bool {
    if state.registry.current_room(conn_id).as_deref() != Some(envelope.room.as_str()) {
        return false;
    }
    match &envelope.exclude_user {
        Some(excluded) => state.registry.user_id(conn_id).as_deref() != Some(excluded.as_str()),
        None => true,
    }
}

/// Dispatch one client frame. Returns `false` when the connection should
/// close (write failure).
async fn process_frame(
    state: &AppState,
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    conn_id: &str,
    frame: ClientFrame,
) -> bool {
    match frame.event {
        ClientEvent::SetId => {
            let payload: SetIdPayload = serde_json::from_value(frame.data).unwrap_or_default();
            let reply = handle_set_id(&state.registry, conn_id, payload);
            send_frame(ws_tx, &reply).await
        }
        ClientEvent::Join => {
            let payload: JoinPayload = serde_json::from_value(frame.data).unwrap_or_default();
            let replies = handle_join(&state.registry, &state.relay, conn_id, payload);
            for reply in &replies {
                if !send_frame(ws_tx, reply).await {
                    return false;
                }
            }
            true
        }
        ClientEvent::Message => {
            handle_relay(&state.relay, conn_id, frame.data);
            true
        }
        ClientEvent::EndBroadcast => {
            handle_end_broadcast(&state.registry, &state.relay, conn_id, frame.data);
            true
        }
        ClientEvent::Unknown => {
            tracing::warn!(%conn_id, "unknown frame kind");
            true
        }
    }
}

async fn send_frame(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> bool {
    let json = serde_json::to_string(frame).unwrap();
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

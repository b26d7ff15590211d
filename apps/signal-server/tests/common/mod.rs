use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use signal_server::config::Config;
use signal_server::signaling::registry::RoomRegistry;
use signal_server::signaling::relay::RelayHub;
use signal_server::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_state() -> AppState {
    AppState {
        registry: Arc::new(RoomRegistry::new()),
        relay: RelayHub::new(),
        config: Arc::new(Config {
            port: 0,
            allowed_origins: vec!["http://localhost:4200".to_string()],
        }),
    }
}

/// Start an actual TCP server for WebSocket testing. Returns (addr, state);
/// the server runs in the background.
pub async fn start_server() -> (SocketAddr, AppState) {
    let state = test_state();
    let app = signal_server::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Connect a WebSocket client to the signaling endpoint.
pub async fn connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{addr}/signal");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Send a frame as JSON text.
pub async fn send_json(ws: &mut WsClient, frame: Value) {
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// Read the next text frame as JSON, with a timeout.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse frame")
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no frame arrives within a short window.
pub async fn assert_no_frame(ws: &mut WsClient) {
    let result = time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "expected silence, got: {result:?}");
}

/// Connect and announce an identity, returning the client and its
/// server-confirmed user id.
pub async fn connect_with_id(addr: SocketAddr, id: Option<&str>) -> (WsClient, String) {
    let mut ws = connect(addr).await;
    let payload = match id {
        Some(id) => serde_json::json!({ "id": id }),
        None => serde_json::json!({}),
    };
    send_json(&mut ws, serde_json::json!({ "event": "setId", "data": payload })).await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["event"], "message");
    assert_eq!(reply["data"]["message"], "set user id");
    let user_id = reply["data"]["id"].as_str().expect("user id").to_string();
    (ws, user_id)
}

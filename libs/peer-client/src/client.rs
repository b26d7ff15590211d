//! Session client: a cloneable handle plus the coordinator task that owns
//! every piece of connection state.
//!
//! The coordinator is the single consumer of signaling events, direct
//! connection events, and caller commands, so no session state needs a
//! lock. Callers talk to it over an unbounded command channel and receive
//! results through one-shot replies.

use std::future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use subvox_common::generate_join_code;
use subvox_common::protocol::{
    ChallengeRequest, ChallengeVerdict, ClientFrame, ControlMessage, HandshakeFrame, RelayPayload,
    RoomMessage, ServerEvent, ServerFrame,
};

use crate::cache::{key, SessionCache};
use crate::error::PeerError;
use crate::mesh::{LinkStage, PeerMesh};
use crate::reconnect::Backoff;
use crate::state::{SessionState, StateEvent};
use crate::transport::{
    DirectProvider, LinkEvent, PeerEndpoint, SignalConnector, SignalSocket, SocketEvent,
};

/// Deadline for the connect and join round trips.
const OP_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for a disconnect acknowledgment.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Lifetime of cached identity, room, and join-code entries.
const CACHE_PERSIST_MINS: u64 = 60;

/// How to join a room.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Room to join as a listener; `None` creates (or resumes) a broadcast.
    pub room: Option<String>,
    /// Join code used to answer the broadcaster's challenge.
    pub join_code: Option<String>,
}

/// Application-facing events.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Payload from a validated peer connection.
    Payload { peer: String, data: Value },
    /// Payload relayed through the signaling server.
    RoomMessage { user: String, message: Value },
    /// The broadcast ended, locally or remotely.
    BroadcastEnded,
    /// A server frame the client does not understand.
    Unhandled(Value),
}

type Waiter<T> = oneshot::Sender<Result<T, PeerError>>;

enum Command {
    Connect { reply: Waiter<String> },
    Disconnect { reply: Waiter<bool> },
    JoinRoom { options: JoinOptions, reply: Waiter<String> },
    SendServerMessage { data: Value },
    ConnectPeerServer { reply: Waiter<String> },
    DisconnectPeerServer { reply: Waiter<bool> },
    EndBroadcast { reply: Waiter<()> },
    SendTo { peer: String, data: Value, reply: Waiter<()> },
    SendToAll { data: Value },
    OperationTimedOut { op: TimedOp },
}

#[derive(Debug, Clone, Copy)]
enum TimedOp {
    Connect,
    Join,
}

/// Handle to a running session coordinator. Cheap to clone; dropping every
/// clone stops the coordinator.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionClient {
    /// Start a coordinator over the given transports and cache. Returns the
    /// client handle and the stream of application-facing events.
    pub fn spawn(
        connector: Arc<dyn SignalConnector>,
        provider: Arc<dyn DirectProvider>,
        cache: Arc<dyn SessionCache>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (socket_events_tx, socket_events) = mpsc::unbounded_channel();
        let (link_events_tx, link_events) = mpsc::unbounded_channel();
        let (app_events, app_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());

        let coordinator = Coordinator {
            connector,
            provider,
            cache,
            commands: command_rx,
            socket_events_tx,
            socket_events,
            link_events_tx,
            link_events,
            app_events,
            state: state_tx,
            socket: None,
            socket_open: false,
            my_id: None,
            my_broadcast: false,
            room: None,
            join_code: None,
            endpoint: None,
            endpoint_open: false,
            endpoint_resumable: false,
            destroying: false,
            mesh: PeerMesh::new(),
            backoff: Backoff::new(),
            retry_at: None,
            pending_connect: Vec::new(),
            pending_join: Vec::new(),
            pending_disconnect: Vec::new(),
            pending_peer_connect: Vec::new(),
            pending_peer_disconnect: Vec::new(),
            pending_end: Vec::new(),
        };
        tokio::spawn(coordinator.run());

        (
            Self {
                commands,
                state: state_rx,
            },
            app_rx,
        )
    }

    /// Dial the signaling server and resolve this session's user id.
    ///
    /// A cached identity resolves as soon as the channel opens; otherwise
    /// the call waits for the server's assignment, up to 30 seconds.
    pub async fn connect(&self) -> Result<String, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        match time::timeout(OP_TIMEOUT, rx).await {
            Ok(result) => result.map_err(|_| PeerError::CoordinatorStopped)?,
            Err(_) => {
                let _ = self
                    .commands
                    .send(Command::OperationTimedOut { op: TimedOp::Connect });
                Err(PeerError::Timeout("connect"))
            }
        }
    }

    /// Close the signaling channel. Resolves `true` on acknowledgment and
    /// `false` when none arrives within half a second.
    pub async fn disconnect(&self) -> Result<bool, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        match time::timeout(DISCONNECT_TIMEOUT, rx).await {
            Ok(result) => result.map_err(|_| PeerError::CoordinatorStopped)?,
            Err(_) => Ok(false),
        }
    }

    /// Join `options.room`, or create a broadcast room when none is given.
    /// Resolves with the server-assigned room id.
    pub async fn join_room(&self, options: JoinOptions) -> Result<String, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinRoom { options, reply })?;
        match time::timeout(OP_TIMEOUT, rx).await {
            Ok(result) => result.map_err(|_| PeerError::CoordinatorStopped)?,
            Err(_) => {
                let _ = self
                    .commands
                    .send(Command::OperationTimedOut { op: TimedOp::Join });
                Err(PeerError::Timeout("join"))
            }
        }
    }

    /// Relay an opaque payload to every member of the current room through
    /// the signaling server.
    pub fn send_server_message(&self, data: Value) {
        let _ = self.commands.send(Command::SendServerMessage { data });
    }

    /// Register a peer endpoint under the session's user id. Requires a
    /// connected signaling session; resolves once the endpoint is live.
    pub async fn connect_peer_server(&self) -> Result<String, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectPeerServer { reply })?;
        rx.await.map_err(|_| PeerError::CoordinatorStopped)?
    }

    /// Destroy the peer endpoint. Resolves `true` once it is torn down.
    pub async fn disconnect_peer_server(&self) -> Result<bool, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DisconnectPeerServer { reply })?;
        rx.await.map_err(|_| PeerError::CoordinatorStopped)?
    }

    /// End the active broadcast: closes every peer connection, clears the
    /// cached room and join code, and resolves when the server echoes the
    /// end signal.
    pub async fn end_broadcast(&self) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EndBroadcast { reply })?;
        rx.await.map_err(|_| PeerError::CoordinatorStopped)?
    }

    /// Send a payload to one peer over its direct connection.
    pub async fn send_to(&self, peer: &str, data: Value) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendTo {
            peer: peer.to_string(),
            data,
            reply,
        })?;
        rx.await.map_err(|_| PeerError::CoordinatorStopped)?
    }

    /// Best-effort send to every live peer connection.
    pub fn send_to_all(&self, data: Value) {
        let _ = self.commands.send(Command::SendToAll { data });
    }

    /// Watch handle over the session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .map_err(|_| PeerError::CoordinatorStopped)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator {
    connector: Arc<dyn SignalConnector>,
    provider: Arc<dyn DirectProvider>,
    cache: Arc<dyn SessionCache>,

    commands: mpsc::UnboundedReceiver<Command>,
    socket_events_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    app_events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SessionState>,

    socket: Option<Box<dyn SignalSocket>>,
    socket_open: bool,
    my_id: Option<String>,
    my_broadcast: bool,
    room: Option<String>,
    join_code: Option<String>,

    endpoint: Option<Box<dyn PeerEndpoint>>,
    endpoint_open: bool,
    endpoint_resumable: bool,
    destroying: bool,
    mesh: PeerMesh,
    backoff: Backoff,
    retry_at: Option<Instant>,

    pending_connect: Vec<Waiter<String>>,
    pending_join: Vec<Waiter<String>>,
    pending_disconnect: Vec<Waiter<bool>>,
    pending_peer_connect: Vec<Waiter<String>>,
    pending_peer_disconnect: Vec<Waiter<bool>>,
    pending_end: Vec<Waiter<()>>,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.socket_events.recv() => {
                    self.handle_socket_event(event).await;
                }
                Some(event) = self.link_events.recv() => {
                    self.handle_link_event(event);
                }
                _ = retry_timer(self.retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.handle_retry_fired();
                }
            }
        }
        debug!("session coordinator stopped");
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.start_connect(reply).await,
            Command::Disconnect { reply } => self.start_disconnect(reply),
            Command::JoinRoom { options, reply } => self.start_join(options, reply).await,
            Command::SendServerMessage { data } => self.relay_to_server(data),
            Command::ConnectPeerServer { reply } => self.start_peer_server(reply).await,
            Command::DisconnectPeerServer { reply } => self.start_peer_server_disconnect(reply),
            Command::EndBroadcast { reply } => self.start_end_broadcast(reply).await,
            Command::SendTo { peer, data, reply } => {
                let _ = reply.send(self.mesh.send_to(&peer, data));
            }
            Command::SendToAll { data } => self.mesh.send_to_all(&data),
            Command::OperationTimedOut { op } => self.note_timeout(op),
        }
    }

    async fn start_connect(&mut self, reply: Waiter<String>) {
        if self.socket_open {
            if let Some(id) = self.my_id.clone() {
                let _ = reply.send(Ok(id));
            } else {
                // Channel open, id exchange still in flight.
                self.pending_connect.push(reply);
            }
            return;
        }

        self.pending_connect.push(reply);
        // Replace any stale handle; progress comes back through the shared
        // event channel.
        self.socket = None;
        match self.connector.connect(self.socket_events_tx.clone()).await {
            Ok(socket) => self.socket = Some(socket),
            Err(error) => {
                warn!(%error, "signaling dial failed");
                self.apply_state(StateEvent::SocketConnectFailed(error.to_string()));
                self.fail_connect(error);
            }
        }
    }

    fn start_disconnect(&mut self, reply: Waiter<bool>) {
        match self.socket.as_deref() {
            Some(socket) => {
                self.pending_disconnect.push(reply);
                socket.close();
            }
            None => {
                debug!("disconnect without an open channel");
                let _ = reply.send(Ok(false));
            }
        }
    }

    async fn start_join(&mut self, options: JoinOptions, reply: Waiter<String>) {
        // No explicit room means we are hosting.
        self.my_broadcast = options.room.is_none();
        let mut room = options.room;

        if room.is_none() {
            if let Some(cached) = self.cache.load(key::ROOM_ID).await {
                if let Some(previous) = cached.get("room").and_then(Value::as_str) {
                    room = Some(previous.to_string());
                }
                if let Some(was_broadcast) = cached.get("myBroadcast").and_then(Value::as_bool) {
                    self.my_broadcast = was_broadcast;
                }
            }
        }

        if self.my_broadcast {
            let code = match self.cached_join_code().await {
                Some(code) => code,
                None => {
                    let code = generate_join_code();
                    self.cache
                        .save(
                            key::JOIN_CODE,
                            json!({ "joinCode": code }),
                            Some(CACHE_PERSIST_MINS),
                        )
                        .await;
                    code
                }
            };
            self.join_code = Some(code.clone());
            self.apply_state(StateEvent::JoinCodeSet(code));
        } else if let Some(code) = options.join_code {
            self.join_code = Some(code.clone());
            self.apply_state(StateEvent::JoinCodeSet(code));
        }

        debug!(room = ?room, broadcast = self.my_broadcast, "joining room");
        self.pending_join.push(reply);
        self.send_frame(ClientFrame::join(room, self.my_broadcast));
    }

    fn relay_to_server(&mut self, data: Value) {
        let (Some(user), Some(room)) = (self.my_id.clone(), self.room.clone()) else {
            warn!("cannot relay without an id and a room");
            return;
        };
        self.send_frame(ClientFrame::relay(RelayPayload {
            user,
            message: data,
            room,
        }));
    }

    async fn start_peer_server(&mut self, reply: Waiter<String>) {
        let Some(id) = self.my_id.clone() else {
            let _ = reply.send(Err(PeerError::MissingIdentity));
            return;
        };
        if self.endpoint.is_some() && self.endpoint_open {
            let _ = reply.send(Ok(id));
            return;
        }
        self.pending_peer_connect.push(reply);
        if self.endpoint.is_some() {
            // Registration already in flight; resolves on EndpointOpen.
            return;
        }
        match self
            .provider
            .open_endpoint(&id, self.link_events_tx.clone())
            .await
        {
            Ok(endpoint) => self.endpoint = Some(endpoint),
            Err(error) => {
                warn!(%error, "peer endpoint registration failed");
                self.apply_state(StateEvent::PeerServerConnectFailed(error.to_string()));
                self.fail_peer_connect(error);
            }
        }
    }

    fn start_peer_server_disconnect(&mut self, reply: Waiter<bool>) {
        match self.endpoint.as_deref() {
            Some(endpoint) => {
                self.pending_peer_disconnect.push(reply);
                self.destroying = true;
                endpoint.destroy();
            }
            None => {
                let _ = reply.send(Err(PeerError::EndpointNotConnected));
            }
        }
    }

    async fn start_end_broadcast(&mut self, reply: Waiter<()>) {
        let cached_room = self.cache.load(key::ROOM_ID).await.and_then(|entry| {
            entry
                .get("room")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let Some(room) = cached_room else {
            let error = PeerError::NoActiveRoom;
            self.apply_state(StateEvent::BroadcastEndFailed(error.to_string()));
            let _ = reply.send(Err(error));
            return;
        };
        self.cache.remove(key::ROOM_ID).await;
        self.cache.remove(key::JOIN_CODE).await;
        self.pending_end.push(reply);
        info!(%room, "ending broadcast");
        self.send_frame(ClientFrame::end_broadcast(&room));
        self.mesh.close_all();
        self.apply_state(StateEvent::PeerCountChanged(0));
    }

    fn note_timeout(&mut self, op: TimedOp) {
        match op {
            TimedOp::Connect => {
                let error = PeerError::Timeout("connect").to_string();
                warn!("{error}");
                self.apply_state(StateEvent::SocketConnectFailed(error));
            }
            TimedOp::Join => {
                let error = PeerError::Timeout("join").to_string();
                warn!("{error}");
                if self.my_broadcast {
                    self.apply_state(StateEvent::BroadcastRoomCreateFailed(error));
                } else {
                    self.apply_state(StateEvent::BroadcastJoinFailed(error));
                }
            }
        }
    }

    // ---- signaling events ----

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected => {
                self.socket_open = true;
                self.apply_state(StateEvent::SocketConnected);
                if self.my_id.is_none() {
                    self.my_id = self.cached_user_id().await;
                }
                let announced = self.my_id.clone();
                info!(user = ?announced, "signaling channel open");
                self.send_frame(ClientFrame::set_id(announced.clone()));
                if let Some(id) = announced {
                    self.apply_state(StateEvent::UserIdAssigned(id.clone()));
                    self.resolve_connect(Ok(id));
                }
            }
            SocketEvent::Disconnected => {
                info!("signaling channel closed");
                self.socket_open = false;
                self.apply_state(StateEvent::SocketDisconnected);
                self.resolve_disconnect(Ok(true));
            }
            SocketEvent::Error(error) => {
                warn!(%error, "signaling transport error");
                self.apply_state(StateEvent::SocketError(error.clone()));
                self.fail_connect(PeerError::Transport(error));
            }
            SocketEvent::Frame(frame) => self.handle_server_frame(frame).await,
        }
    }

    async fn handle_server_frame(&mut self, frame: ServerFrame) {
        match frame.event {
            ServerEvent::Message => {
                match serde_json::from_value::<ControlMessage>(frame.data.clone()) {
                    Ok(control) => self.handle_control(control).await,
                    Err(_) => {
                        warn!("unhandled server message");
                        let _ = self.app_events.send(SessionEvent::Unhandled(frame.data));
                    }
                }
            }
            ServerEvent::NewMessage => {
                match serde_json::from_value::<RoomMessage>(frame.data.clone()) {
                    Ok(relayed) => {
                        let _ = self.app_events.send(SessionEvent::RoomMessage {
                            user: relayed.user,
                            message: relayed.message,
                        });
                    }
                    Err(_) => {
                        warn!("malformed room message");
                        let _ = self.app_events.send(SessionEvent::Unhandled(frame.data));
                    }
                }
            }
            ServerEvent::EndBroadcast => self.handle_broadcast_ended(),
            ServerEvent::Unknown => {
                warn!("unknown server frame");
                let _ = self.app_events.send(SessionEvent::Unhandled(frame.data));
            }
        }
    }

    async fn handle_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::SetUserId { id } => self.handle_user_id(id).await,
            ControlMessage::RoomJoined { room, .. } => self.handle_room_joined(room).await,
            ControlMessage::UserJoined { user, .. } => self.handle_user_joined(user),
            ControlMessage::UserLeft { user, .. } => {
                if !user.is_empty() {
                    debug!(%user, "peer left the room");
                    self.mesh.close(&user);
                }
            }
            ControlMessage::ConnectClients { clients } => {
                for peer in clients {
                    if Some(peer.as_str()) != self.my_id.as_deref() {
                        self.dial_peer(&peer);
                    }
                }
            }
        }
    }

    async fn handle_user_id(&mut self, id: String) {
        match self.my_id.clone() {
            Some(mine) if mine == id => self.resolve_connect(Ok(mine)),
            Some(mine) => {
                // The server allocated a fresh id; insist on the one we hold.
                debug!(server = %id, held = %mine, "re-announcing cached id");
                self.send_frame(ClientFrame::set_id(Some(mine)));
            }
            None => {
                self.my_id = Some(id.clone());
                self.cache
                    .save(key::USER_ID, json!({ "id": id }), Some(CACHE_PERSIST_MINS))
                    .await;
                self.apply_state(StateEvent::UserIdAssigned(id.clone()));
                info!(user = %id, "assigned user id");
                self.resolve_connect(Ok(id));
            }
        }
    }

    async fn handle_room_joined(&mut self, room: String) {
        if room.is_empty() {
            // Callers wait for the first non-empty room id.
            return;
        }
        self.cache
            .save(
                key::ROOM_ID,
                json!({ "room": room, "myBroadcast": self.my_broadcast }),
                Some(CACHE_PERSIST_MINS),
            )
            .await;
        if self.my_broadcast {
            self.apply_state(StateEvent::BroadcastRoomCreated(room.clone()));
        } else {
            self.apply_state(StateEvent::BroadcastRoomJoined(room.clone()));
            self.apply_state(StateEvent::BroadcastJoinSucceeded);
        }
        info!(%room, broadcast = self.my_broadcast, "joined room");
        self.room = Some(room.clone());
        self.resolve_join(Ok(room));
    }

    fn handle_user_joined(&mut self, user: String) {
        if user.is_empty() || Some(user.as_str()) == self.my_id.as_deref() {
            return;
        }
        if self.endpoint.is_none() {
            let missing = PeerError::EndpointMissing;
            error!(%user, "{missing}");
            self.apply_state(StateEvent::PeerServerError(missing.to_string()));
            return;
        }
        if self.my_broadcast {
            self.dial_peer(&user);
        } else {
            debug!(%user, "peer joined the broadcast");
        }
    }

    fn handle_broadcast_ended(&mut self) {
        info!("broadcast ended");
        self.mesh.close_all();
        self.room = None;
        self.join_code = None;
        self.apply_state(StateEvent::PeerCountChanged(0));
        self.apply_state(StateEvent::BroadcastEnded);
        self.apply_state(StateEvent::JoinCodeCleared);
        let _ = self.app_events.send(SessionEvent::BroadcastEnded);
        self.resolve_end(Ok(()));
    }

    // ---- direct-connection events ----

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::EndpointOpen => {
                info!("peer endpoint open");
                self.endpoint_open = true;
                self.endpoint_resumable = false;
                self.backoff.reset();
                self.retry_at = None;
                self.apply_state(StateEvent::PeerServerConnected);
                if let Some(id) = self.my_id.clone() {
                    self.resolve_peer_connect(Ok(id));
                }
            }
            LinkEvent::EndpointDisconnected => {
                self.endpoint_open = false;
                self.apply_state(StateEvent::PeerServerDisconnected);
                if self.destroying {
                    info!("peer endpoint destroyed");
                    self.destroying = false;
                    self.endpoint = None;
                    self.endpoint_resumable = false;
                    self.resolve_peer_disconnect(Ok(true));
                } else {
                    debug!("peer endpoint disconnected");
                    self.endpoint_resumable = true;
                }
            }
            LinkEvent::EndpointError(error) => {
                warn!(%error, "peer endpoint error");
                self.endpoint_open = false;
                self.apply_state(StateEvent::PeerServerError(error));
                self.schedule_retry();
            }
            LinkEvent::IncomingConnection { peer, link } => {
                if self.mesh.insert(&peer, link, LinkStage::Connecting) {
                    debug!(%peer, "incoming peer connection");
                    self.apply_state(StateEvent::PeerCountChanged(self.mesh.len()));
                } else {
                    debug!(%peer, "duplicate incoming connection ignored");
                }
            }
            LinkEvent::ConnectionOpen { peer } => {
                debug!(%peer, "peer connection open");
                self.mesh.set_stage(&peer, LinkStage::Open);
                if self.my_broadcast {
                    self.send_challenge(&peer);
                }
            }
            LinkEvent::ConnectionData { peer, data } => self.handle_peer_data(peer, data),
            LinkEvent::ConnectionClosed { peer } => {
                if self.mesh.remove(&peer) {
                    debug!(%peer, "peer connection closed");
                    self.apply_state(StateEvent::PeerCountChanged(self.mesh.len()));
                }
            }
        }
    }

    fn dial_peer(&mut self, peer: &str) {
        if self.mesh.contains(peer) {
            debug!(%peer, "already connected");
            return;
        }
        let Some(endpoint) = self.endpoint.as_deref() else {
            let missing = PeerError::EndpointMissing;
            error!(%peer, "{missing}");
            self.apply_state(StateEvent::PeerServerError(missing.to_string()));
            return;
        };
        match endpoint.connect(peer) {
            Ok(link) => {
                debug!(%peer, "dialing peer");
                self.mesh.insert(peer, link, LinkStage::Connecting);
                self.apply_state(StateEvent::PeerCountChanged(self.mesh.len()));
            }
            Err(error) => {
                error!(%peer, %error, "peer dial failed");
                self.apply_state(StateEvent::PeerServerError(error.to_string()));
            }
        }
    }

    fn send_challenge(&mut self, peer: &str) {
        let request = HandshakeFrame::Request(ChallengeRequest::JoinCode);
        match self.mesh.send_to(peer, serde_json::to_value(&request).unwrap()) {
            Ok(()) => self.mesh.set_stage(peer, LinkStage::ChallengePending),
            Err(error) => warn!(%peer, %error, "challenge send failed"),
        }
    }

    fn handle_peer_data(&mut self, peer: String, data: Value) {
        match serde_json::from_value::<HandshakeFrame>(data.clone()) {
            Ok(HandshakeFrame::Request(ChallengeRequest::JoinCode)) => {
                // The broadcaster is challenging us; answer with our code.
                let answer = HandshakeFrame::Request(ChallengeRequest::ValidateJoinCode {
                    join_code: self.join_code.clone(),
                });
                if let Err(error) = self
                    .mesh
                    .send_to(&peer, serde_json::to_value(&answer).unwrap())
                {
                    warn!(%peer, %error, "challenge answer failed");
                }
            }
            Ok(HandshakeFrame::Request(ChallengeRequest::ValidateJoinCode { join_code })) => {
                let valid = match (&self.join_code, &join_code) {
                    (Some(mine), Some(theirs)) => mine.eq_ignore_ascii_case(theirs),
                    _ => false,
                };
                let verdict = if valid {
                    ChallengeVerdict::Valid
                } else {
                    ChallengeVerdict::Invalid
                };
                let frame = HandshakeFrame::Verdict(verdict);
                if let Err(error) = self
                    .mesh
                    .send_to(&peer, serde_json::to_value(&frame).unwrap())
                {
                    warn!(%peer, %error, "verdict send failed");
                }
                self.mesh.set_stage(
                    &peer,
                    if valid {
                        LinkStage::Validated
                    } else {
                        LinkStage::Rejected
                    },
                );
                if !valid {
                    warn!(%peer, "join code rejected");
                }
            }
            Ok(HandshakeFrame::Verdict(ChallengeVerdict::Valid)) => {
                debug!(%peer, "join code accepted");
                self.mesh.set_stage(&peer, LinkStage::Validated);
            }
            Ok(HandshakeFrame::Verdict(ChallengeVerdict::Invalid)) => {
                warn!(%peer, "join code rejected by broadcaster");
                self.mesh.set_stage(&peer, LinkStage::Rejected);
            }
            Err(_) => {
                // Application payload: only validated peers are trusted.
                if self.mesh.stage(&peer) == Some(LinkStage::Validated) {
                    let _ = self.app_events.send(SessionEvent::Payload { peer, data });
                } else {
                    debug!(%peer, "payload from unvalidated peer dropped");
                }
            }
        }
    }

    // ---- peer-server retry ----

    fn schedule_retry(&mut self) {
        if self.retry_at.is_some() {
            // One scheduled retry at a time.
            return;
        }
        match self.backoff.schedule() {
            Some(delay) => {
                debug!(?delay, "peer server retry scheduled");
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                let timed_out = PeerError::ReconnectTimedOut;
                error!("{timed_out}");
                self.apply_state(StateEvent::PeerServerConnectFailed(timed_out.to_string()));
                self.fail_peer_connect(timed_out);
            }
        }
    }

    fn handle_retry_fired(&mut self) {
        match self.endpoint.as_deref() {
            Some(endpoint) if self.endpoint_resumable => {
                debug!("attempting peer server resume");
                endpoint.reconnect();
            }
            _ => self.schedule_retry(),
        }
    }

    // ---- plumbing ----

    fn send_frame(&mut self, frame: ClientFrame) {
        match self.socket.as_deref() {
            Some(socket) => {
                if let Err(error) = socket.send(frame) {
                    warn!(%error, "frame send failed");
                }
            }
            None => warn!("no signaling channel; frame dropped"),
        }
    }

    fn apply_state(&mut self, event: StateEvent) {
        self.state.send_modify(|state| state.apply(event));
    }

    async fn cached_user_id(&self) -> Option<String> {
        let cached = self.cache.load(key::USER_ID).await?;
        cached.get("id").and_then(Value::as_str).map(str::to_string)
    }

    async fn cached_join_code(&self) -> Option<String> {
        let cached = self.cache.load(key::JOIN_CODE).await?;
        cached
            .get("joinCode")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn resolve_connect(&mut self, result: Result<String, PeerError>) {
        for waiter in self.pending_connect.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn fail_connect(&mut self, error: PeerError) {
        self.resolve_connect(Err(error));
    }

    fn resolve_join(&mut self, result: Result<String, PeerError>) {
        for waiter in self.pending_join.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_disconnect(&mut self, result: Result<bool, PeerError>) {
        for waiter in self.pending_disconnect.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_peer_connect(&mut self, result: Result<String, PeerError>) {
        for waiter in self.pending_peer_connect.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn fail_peer_connect(&mut self, error: PeerError) {
        self.resolve_peer_connect(Err(error));
    }

    fn resolve_peer_disconnect(&mut self, result: Result<bool, PeerError>) {
        for waiter in self.pending_peer_disconnect.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_end(&mut self, result: Result<(), PeerError>) {
        for waiter in self.pending_end.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

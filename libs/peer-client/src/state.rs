//! Observable session state and the events that advance it.

/// Point-in-time snapshot of the client session, published through a watch
/// channel so embedders can render connection status without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub socket_connected: bool,
    pub peer_connected: bool,
    /// Pessimistic until the first successful socket connect.
    pub server_offline: bool,
    pub peer_connection_count: usize,
    pub is_broadcasting: bool,
    pub is_viewing_broadcast: bool,
    pub user_id: Option<String>,
    pub room_id: Option<String>,
    pub join_code: Option<String>,
    /// Most recent error text; cleared by the next successful connect.
    pub error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            socket_connected: false,
            peer_connected: false,
            server_offline: true,
            peer_connection_count: 0,
            is_broadcasting: false,
            is_viewing_broadcast: false,
            user_id: None,
            room_id: None,
            join_code: None,
            error: None,
        }
    }
}

/// One observable lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    SocketConnected,
    SocketConnectFailed(String),
    SocketError(String),
    SocketDisconnected,
    UserIdAssigned(String),
    PeerServerConnected,
    PeerServerConnectFailed(String),
    PeerServerDisconnected,
    PeerServerError(String),
    BroadcastRoomCreated(String),
    BroadcastRoomCreateFailed(String),
    BroadcastRoomJoined(String),
    BroadcastJoinSucceeded,
    BroadcastJoinFailed(String),
    BroadcastEnded,
    BroadcastEndFailed(String),
    JoinCodeSet(String),
    JoinCodeCleared,
    PeerCountChanged(usize),
}

impl SessionState {
    /// Advance the snapshot by one event.
    pub fn apply(&mut self, event: StateEvent) {
        match event {
            StateEvent::SocketConnected => {
                self.socket_connected = true;
                self.server_offline = false;
                self.error = None;
            }
            StateEvent::SocketConnectFailed(error) => {
                self.socket_connected = false;
                self.server_offline = true;
                self.error = Some(error);
            }
            StateEvent::SocketError(error) => {
                self.socket_connected = false;
                self.error = Some(error);
            }
            StateEvent::SocketDisconnected => {
                self.socket_connected = false;
                self.user_id = None;
            }
            StateEvent::UserIdAssigned(id) => self.user_id = Some(id),
            StateEvent::PeerServerConnected => {
                self.peer_connected = true;
                self.error = None;
            }
            StateEvent::PeerServerConnectFailed(error) => {
                self.peer_connected = false;
                self.error = Some(error);
            }
            StateEvent::PeerServerDisconnected => self.peer_connected = false,
            StateEvent::PeerServerError(error) => {
                self.peer_connected = false;
                self.error = Some(error);
            }
            StateEvent::BroadcastRoomCreated(room) => {
                self.room_id = Some(room);
                self.is_broadcasting = true;
            }
            StateEvent::BroadcastRoomCreateFailed(error) => self.error = Some(error),
            StateEvent::BroadcastRoomJoined(room) => self.room_id = Some(room),
            StateEvent::BroadcastJoinSucceeded => self.is_viewing_broadcast = true,
            StateEvent::BroadcastJoinFailed(error) => {
                self.is_viewing_broadcast = false;
                self.error = Some(error);
            }
            StateEvent::BroadcastEnded => {
                self.is_broadcasting = false;
                self.is_viewing_broadcast = false;
                self.room_id = None;
            }
            StateEvent::BroadcastEndFailed(error) => {
                self.is_broadcasting = false;
                self.error = Some(error);
            }
            StateEvent::JoinCodeSet(code) => self.join_code = Some(code),
            StateEvent::JoinCodeCleared => self.join_code = None,
            StateEvent::PeerCountChanged(count) => self.peer_connection_count = count,
        }
    }
}

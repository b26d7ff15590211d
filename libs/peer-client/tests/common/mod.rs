//! Test doubles for the transport seams plus spawn and wait helpers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Duration, Instant};

use subvox_common::protocol::{ClientFrame, ControlMessage, ServerFrame};
use subvox_peer::cache::MemoryCache;
use subvox_peer::error::PeerError;
use subvox_peer::transport::{
    DirectProvider, LinkEvent, PeerEndpoint, PeerLink, SignalConnector, SignalSocket, SocketEvent,
};
use subvox_peer::{SessionClient, SessionEvent, SessionState};

// ---------------------------------------------------------------------------
// Signaling double
// ---------------------------------------------------------------------------

pub struct FakeConnector {
    /// Emit `Connected` as soon as the coordinator dials.
    pub auto_connect: bool,
    /// Answer `close()` with a `Disconnected` event.
    pub ack_close: bool,
    pub connect_calls: AtomicUsize,
    pub events: Mutex<Option<UnboundedSender<SocketEvent>>>,
    pub sent: Arc<Mutex<Vec<ClientFrame>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            auto_connect: true,
            ack_close: true,
            connect_calls: AtomicUsize::new(0),
            events: Mutex::new(None),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sender for simulating server activity. Panics before the first dial.
    pub fn events(&self) -> UnboundedSender<SocketEvent> {
        self.events.lock().clone().expect("transport not dialed yet")
    }

    pub fn push_frame(&self, frame: ServerFrame) {
        self.events()
            .send(SocketEvent::Frame(frame))
            .expect("coordinator gone");
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` frames were sent, returning them all.
    pub async fn wait_sent(&self, count: usize) -> Vec<ClientFrame> {
        wait_until(|| {
            let sent = self.sent.lock();
            (sent.len() >= count).then(|| sent.clone())
        })
        .await
    }
}

struct FakeSocket {
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    events: UnboundedSender<SocketEvent>,
    ack_close: bool,
}

impl SignalSocket for FakeSocket {
    fn send(&self, frame: ClientFrame) -> Result<(), PeerError> {
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        if self.ack_close {
            let _ = self.events.send(SocketEvent::Disconnected);
        }
    }
}

#[async_trait]
impl SignalConnector for FakeConnector {
    async fn connect(
        &self,
        events: UnboundedSender<SocketEvent>,
    ) -> Result<Box<dyn SignalSocket>, PeerError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.events.lock() = Some(events.clone());
        if self.auto_connect {
            let _ = events.send(SocketEvent::Connected);
        }
        Ok(Box::new(FakeSocket {
            sent: Arc::clone(&self.sent),
            events,
            ack_close: self.ack_close,
        }))
    }
}

// ---------------------------------------------------------------------------
// Direct-connection double
// ---------------------------------------------------------------------------

pub struct FakeProvider {
    /// Emit `EndpointOpen` as soon as the endpoint is registered.
    pub auto_open: bool,
    pub opened_as: Mutex<Vec<String>>,
    pub endpoint: Arc<FakeEndpoint>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            auto_open: true,
            opened_as: Mutex::new(Vec::new()),
            endpoint: Arc::new(FakeEndpoint::new()),
        }
    }
}

#[async_trait]
impl DirectProvider for FakeProvider {
    async fn open_endpoint(
        &self,
        user_id: &str,
        events: UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn PeerEndpoint>, PeerError> {
        self.opened_as.lock().push(user_id.to_string());
        *self.endpoint.events.lock() = Some(events.clone());
        if self.auto_open {
            let _ = events.send(LinkEvent::EndpointOpen);
        }
        Ok(Box::new(EndpointHandle(Arc::clone(&self.endpoint))))
    }
}

pub struct FakeEndpoint {
    /// Emit `ConnectionOpen` as soon as a peer is dialed.
    pub auto_open_links: bool,
    /// Answer `destroy()` with an `EndpointDisconnected` event.
    pub ack_destroy: bool,
    pub dialed: Mutex<Vec<String>>,
    pub reconnects: Mutex<Vec<Instant>>,
    /// Outcome per `reconnect()` call: `true` emits `EndpointOpen`, `false`
    /// emits `EndpointError`. An empty queue emits nothing.
    pub resume_outcomes: Mutex<VecDeque<bool>>,
    pub destroyed: AtomicBool,
    pub links: Mutex<HashMap<String, Arc<FakeLinkState>>>,
    pub events: Mutex<Option<UnboundedSender<LinkEvent>>>,
}

impl FakeEndpoint {
    fn new() -> Self {
        Self {
            auto_open_links: true,
            ack_destroy: true,
            dialed: Mutex::new(Vec::new()),
            reconnects: Mutex::new(Vec::new()),
            resume_outcomes: Mutex::new(VecDeque::new()),
            destroyed: AtomicBool::new(false),
            links: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
        }
    }

    /// Sender for simulating endpoint and connection events. Panics before
    /// the endpoint is registered.
    pub fn events(&self) -> UnboundedSender<LinkEvent> {
        self.events.lock().clone().expect("endpoint not registered yet")
    }

    /// Deliver a payload as if `peer` sent it over its data channel.
    pub fn push_data(&self, peer: &str, data: Value) {
        self.events()
            .send(LinkEvent::ConnectionData {
                peer: peer.to_string(),
                data,
            })
            .expect("coordinator gone");
    }

    /// Hand the coordinator an incoming connection from `peer`, returning
    /// the state recorder for its link.
    pub fn push_incoming(&self, peer: &str) -> Arc<FakeLinkState> {
        let events = self.events();
        let state = Arc::new(FakeLinkState::new(peer, events.clone()));
        self.links.lock().insert(peer.to_string(), Arc::clone(&state));
        events
            .send(LinkEvent::IncomingConnection {
                peer: peer.to_string(),
                link: Box::new(FakeLink(Arc::clone(&state))),
            })
            .expect("coordinator gone");
        state
    }

    /// Wait for `peer` to be dialed and return its link recorder.
    pub async fn wait_link(&self, peer: &str) -> Arc<FakeLinkState> {
        wait_until(|| self.links.lock().get(peer).cloned()).await
    }
}

pub struct EndpointHandle(pub Arc<FakeEndpoint>);

impl PeerEndpoint for EndpointHandle {
    fn connect(&self, peer: &str) -> Result<Box<dyn PeerLink>, PeerError> {
        let events = self.0.events();
        let state = Arc::new(FakeLinkState::new(peer, events.clone()));
        self.0.dialed.lock().push(peer.to_string());
        self.0
            .links
            .lock()
            .insert(peer.to_string(), Arc::clone(&state));
        if self.0.auto_open_links {
            let _ = events.send(LinkEvent::ConnectionOpen {
                peer: peer.to_string(),
            });
        }
        Ok(Box::new(FakeLink(state)))
    }

    fn reconnect(&self) {
        self.0.reconnects.lock().push(Instant::now());
        if let Some(success) = self.0.resume_outcomes.lock().pop_front() {
            let events = self.0.events();
            let event = if success {
                LinkEvent::EndpointOpen
            } else {
                LinkEvent::EndpointError("resume failed".to_string())
            };
            let _ = events.send(event);
        }
    }

    fn destroy(&self) {
        self.0.destroyed.store(true, Ordering::SeqCst);
        if self.0.ack_destroy {
            let _ = self.0.events().send(LinkEvent::EndpointDisconnected);
        }
    }
}

pub struct FakeLinkState {
    pub peer: String,
    pub sent: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
    pub refuse_send: AtomicBool,
    events: UnboundedSender<LinkEvent>,
}

impl FakeLinkState {
    fn new(peer: &str, events: UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer: peer.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            refuse_send: AtomicBool::new(false),
            events,
        }
    }

    pub fn sent_payloads(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` payloads were sent on this link.
    pub async fn wait_sent(&self, count: usize) -> Vec<Value> {
        wait_until(|| {
            let sent = self.sent.lock();
            (sent.len() >= count).then(|| sent.clone())
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeLink(pub Arc<FakeLinkState>);

impl PeerLink for FakeLink {
    fn send(&self, data: Value) -> Result<(), PeerError> {
        if self.0.refuse_send.load(Ordering::SeqCst) {
            return Err(PeerError::Transport("link closed".to_string()));
        }
        self.0.sent.lock().push(data);
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        let _ = self.0.events.send(LinkEvent::ConnectionClosed {
            peer: self.0.peer.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub client: SessionClient,
    pub events: UnboundedReceiver<SessionEvent>,
    pub connector: Arc<FakeConnector>,
    pub provider: Arc<FakeProvider>,
    pub cache: Arc<MemoryCache>,
}

pub fn spawn_harness() -> Harness {
    spawn_with(FakeConnector::new(), FakeProvider::new())
}

pub fn spawn_with(connector: FakeConnector, provider: FakeProvider) -> Harness {
    let connector = Arc::new(connector);
    let provider = Arc::new(provider);
    let cache = Arc::new(MemoryCache::new());
    let (client, events) =
        SessionClient::spawn(connector.clone(), provider.clone(), cache.clone());
    Harness {
        client,
        events,
        connector,
        provider,
        cache,
    }
}

/// Connect and establish `id` as the session identity via a server echo.
pub async fn establish_identity(harness: &Harness, id: &str) -> String {
    let echo = async {
        harness.connector.wait_sent(1).await;
        harness
            .connector
            .push_frame(ServerFrame::control(&ControlMessage::SetUserId {
                id: id.to_string(),
            }));
    };
    let (connected, ()) = tokio::join!(harness.client.connect(), echo);
    connected.expect("connect failed")
}

// ---------------------------------------------------------------------------
// Wait helpers
// ---------------------------------------------------------------------------

/// Poll `probe` until it yields, panicking after five seconds.
pub async fn wait_until<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("condition not reached within 5s");
        }
        time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the session state satisfies `predicate`, returning the
/// snapshot that did.
pub async fn wait_state(
    client: &SessionClient,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut watch = client.state();
    let state = time::timeout(Duration::from_secs(5), watch.wait_for(predicate))
        .await
        .expect("state condition not reached within 5s")
        .expect("coordinator gone")
        .clone();
    state
}

pub async fn recv_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no session event within 5s")
        .expect("event channel closed")
}

/// Assert that no application event arrives within a short window.
pub async fn assert_no_event(events: &mut UnboundedReceiver<SessionEvent>) {
    time::sleep(Duration::from_millis(100)).await;
    if let Ok(event) = events.try_recv() {
        panic!("unexpected session event: {event:?}");
    }
}

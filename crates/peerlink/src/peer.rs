//! The peer: owns the signaling socket, the identity and the connection
//! registry, and routes inbound signaling to connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::codec::{BincodeCodec, Codec};
use crate::config::{PeerOptions, TransportConfig};
use crate::connection::{
    Connection, ConnectionHost, ConnectionKind, DataConnection, DataConnectionOptions,
    MediaConnection, MediaOptions,
};
use crate::error::{ErrorKind, PeerError};
use crate::identity::validate_id;
use crate::logging;
use crate::lost::LostMessageStore;
use crate::provider::{MediaStream, TransportProvider};
use crate::signaling::{
    MessageType, ServerMessage, SignalingConnector, SignalingSocket, SocketEvent, SocketListener,
    WebSocketConnector,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The server confirmed this identity.
    Open(String),
    /// A remote peer opened a data connection.
    Connection(DataConnection),
    /// A remote peer is calling; answer with [`MediaConnection::answer`].
    Call(MediaConnection),
    /// The signaling link is gone; carries the identity that was in use.
    Disconnected(Option<String>),
    Close,
    Error(PeerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Initializing,
    Open,
    Disconnected,
    Destroyed,
}

/// Handle to a peer. Clones share the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

pub struct PeerBuilder {
    options: PeerOptions,
    provider: Arc<dyn TransportProvider>,
    connector: Arc<dyn SignalingConnector>,
    codec: Arc<dyn Codec>,
    http: Option<reqwest::Client>,
}

impl PeerBuilder {
    pub fn new(options: PeerOptions, provider: impl TransportProvider + 'static) -> Self {
        Self {
            options,
            provider: Arc::new(provider),
            connector: Arc::new(WebSocketConnector::new()),
            codec: Arc::new(BincodeCodec),
            http: None,
        }
    }

    pub fn connector(mut self, connector: impl SignalingConnector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Client used to fetch an identity from the server.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn build(self) -> Peer {
        Peer::from_builder(self)
    }
}

struct Status {
    state: PeerState,
    id: Option<String>,
    last_server_id: Option<String>,
}

struct PeerInner {
    options: PeerOptions,
    provider: Arc<dyn TransportProvider>,
    codec: Arc<dyn Codec>,
    http: reqwest::Client,
    socket: SignalingSocket,
    status: Mutex<Status>,
    destroyed: AtomicBool,
    registry: Mutex<HashMap<String, Vec<Connection>>>,
    lost: Mutex<LostMessageStore>,
    id_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    weak_self: Weak<PeerInner>,
}

impl Peer {
    /// Peer on the default WebSocket signaling link.
    pub fn new(options: PeerOptions, provider: impl TransportProvider + 'static) -> Self {
        PeerBuilder::new(options, provider).build()
    }

    pub fn with_connector(
        options: PeerOptions,
        provider: impl TransportProvider + 'static,
        connector: impl SignalingConnector + 'static,
    ) -> Self {
        PeerBuilder::new(options, provider)
            .connector(connector)
            .build()
    }

    pub fn builder(options: PeerOptions, provider: impl TransportProvider + 'static) -> PeerBuilder {
        PeerBuilder::new(options, provider)
    }

    fn from_builder(builder: PeerBuilder) -> Self {
        let PeerBuilder {
            mut options,
            provider,
            connector,
            codec,
            http,
        } = builder;
        options.identity = options.identity.filter(|id| !id.is_empty());
        match logging::init(&options.logging) {
            Ok(true) => info!(target: "peerlink::peer", level = %options.logging.level, "logging enabled"),
            Ok(false) => {}
            Err(err) => debug!(target: "peerlink::peer", error = %err, "keeping existing log subscriber"),
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak_self: &Weak<PeerInner>| {
            let socket = SignalingSocket::new(&options, connector);
            let listener: Weak<dyn SocketListener> = weak_self.clone();
            socket.set_listener(listener);
            PeerInner {
                options,
                provider,
                codec,
                http: http.unwrap_or_default(),
                socket,
                status: Mutex::new(Status {
                    state: PeerState::Initializing,
                    id: None,
                    last_server_id: None,
                }),
                destroyed: AtomicBool::new(false),
                registry: Mutex::new(HashMap::new()),
                lost: Mutex::new(LostMessageStore::new()),
                id_task: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                weak_self: weak_self.clone(),
            }
        });
        inner.boot();
        Self { inner }
    }

    /// Peer events; available once. Events emitted before the first call are buffered.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.inner.events_rx.lock().take()
    }

    pub fn id(&self) -> Option<String> {
        self.inner.status.lock().id.clone()
    }

    pub fn state(&self) -> PeerState {
        self.inner.status.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == PeerState::Open
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.is_disconnected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == PeerState::Destroyed
    }

    pub fn options(&self) -> &PeerOptions {
        &self.inner.options
    }

    /// Open a data connection to `peer`. The connection is returned before
    /// it opens; wait for its `Open` event.
    pub fn connect(&self, peer: &str, options: DataConnectionOptions) -> Option<DataConnection> {
        self.inner.connect(peer, options)
    }

    /// Call `peer` with a local stream.
    pub fn call(
        &self,
        peer: &str,
        stream: Option<MediaStream>,
        options: MediaOptions,
    ) -> Option<MediaConnection> {
        self.inner.call(peer, stream, options)
    }

    pub fn connection(&self, peer: &str, connection_id: &str) -> Option<Connection> {
        self.inner.connection(peer, connection_id)
    }

    /// Snapshot of the registry.
    pub fn connections(&self) -> HashMap<String, Vec<Connection>> {
        self.inner.registry.lock().clone()
    }

    /// Close the signaling link and keep live connections.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Reopen the signaling link with the last identity.
    pub fn reconnect(&self) {
        self.inner.reconnect();
    }

    /// Close every connection and the signaling link. Terminal.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("Peer")
            .field("id", &status.id)
            .field("state", &status.state)
            .finish()
    }
}

impl PeerInner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let error = PeerError::new(kind, message);
        error!(target: "peerlink::peer", kind = %error.kind, "{}", error.message);
        self.emit(PeerEvent::Error(error));
    }

    fn host(&self) -> Option<Arc<dyn ConnectionHost>> {
        let host: Arc<dyn ConnectionHost> = self.weak_self.upgrade()?;
        Some(host)
    }

    fn is_initializing(&self) -> bool {
        self.status.lock().state == PeerState::Initializing
    }

    fn is_disconnected(&self) -> bool {
        matches!(
            self.status.lock().state,
            PeerState::Disconnected | PeerState::Destroyed
        )
    }

    fn boot(&self) {
        let capabilities = self.provider.capabilities();
        if !capabilities.data && !capabilities.media {
            self.abort(
                ErrorKind::Incompatible,
                "The transport provider supports neither data channels nor media",
            );
            return;
        }
        if let Some(id) = &self.options.identity {
            if !validate_id(id) {
                self.abort(ErrorKind::InvalidId, format!("ID \"{id}\" is invalid"));
                return;
            }
        }
        self.obtain_identity(self.options.identity.clone());
    }

    fn obtain_identity(&self, identity: Option<String>) {
        match identity {
            Some(id) => self.initialize(id),
            None => self.retrieve_identity(),
        }
    }

    fn retrieve_identity(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                self.abort(
                    ErrorKind::ServerError,
                    format!("Could not get an ID from the server. {err}"),
                );
                return;
            }
        };
        let peer = self.weak_self.clone();
        let client = self.http.clone();
        let options = self.options.clone();
        let task = runtime.spawn(async move {
            let result = api::retrieve_id(&client, &options).await;
            let Some(peer) = peer.upgrade() else {
                return;
            };
            if !peer.is_initializing() {
                debug!(target: "peerlink::peer", "identity fetch finished after the peer moved on");
                return;
            }
            match result {
                Ok(id) => peer.initialize(id),
                Err(err) => peer.abort(
                    ErrorKind::ServerError,
                    format!("Could not get an ID from the server. {err}"),
                ),
            }
        });
        if let Some(previous) = self.id_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn initialize(&self, id: String) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut status = self.status.lock();
            if status.state != PeerState::Initializing {
                debug!(
                    target: "peerlink::peer",
                    %id,
                    state = ?status.state,
                    "identity arrived outside initialization; ignored"
                );
                return;
            }
            status.id = Some(id.clone());
        }
        debug!(target: "peerlink::peer", %id, "starting signaling socket");
        if let Err(err) = self.socket.start(&id, &self.options.token) {
            self.abort(ErrorKind::SocketError, err.to_string());
        }
    }

    /// Report a fatal error, then destroy if no identity was ever confirmed
    /// or disconnect otherwise.
    fn abort(&self, kind: ErrorKind, message: impl Into<String>) {
        self.emit_error(kind, message);
        let confirmed = self.status.lock().last_server_id.is_some();
        if confirmed {
            self.disconnect();
        } else {
            self.destroy();
        }
    }

    fn connect(&self, peer: &str, options: DataConnectionOptions) -> Option<DataConnection> {
        if self.is_disconnected() {
            warn!(target: "peerlink::peer", %peer, "connect after disconnecting from the server");
            self.emit_error(
                ErrorKind::Disconnected,
                "Cannot connect to new Peer after disconnecting from server.",
            );
            return None;
        }
        let host = self.host()?;
        let connection = DataConnection::new(peer, options, None, &host);
        self.add_connection(Connection::Data(connection.clone()));
        connection.start();
        Some(connection)
    }

    fn call(
        &self,
        peer: &str,
        stream: Option<MediaStream>,
        options: MediaOptions,
    ) -> Option<MediaConnection> {
        if self.is_disconnected() {
            warn!(target: "peerlink::peer", %peer, "call after disconnecting from the server");
            self.emit_error(
                ErrorKind::Disconnected,
                "Cannot connect to new Peer after disconnecting from server.",
            );
            return None;
        }
        let Some(stream) = stream else {
            self.emit_error(
                ErrorKind::InvalidStream,
                "To call a peer, you must provide a local media stream.",
            );
            return None;
        };
        let host = self.host()?;
        let connection = MediaConnection::new(peer, Some(stream), options, None, &host);
        self.add_connection(Connection::Media(connection.clone()));
        connection.start();
        Some(connection)
    }

    fn add_connection(&self, connection: Connection) {
        debug!(
            target: "peerlink::peer",
            peer = %connection.peer(),
            connection_id = %connection.connection_id(),
            kind = %connection.kind(),
            "adding connection"
        );
        self.registry
            .lock()
            .entry(connection.peer().to_string())
            .or_default()
            .push(connection);
    }

    fn connection(&self, peer: &str, connection_id: &str) -> Option<Connection> {
        self.registry
            .lock()
            .get(peer)?
            .iter()
            .find(|connection| connection.connection_id() == connection_id)
            .cloned()
    }

    fn handle_message(&self, message: ServerMessage) {
        let peer = message.src.clone();
        match message.kind {
            MessageType::Open => {
                let id = {
                    let mut status = self.status.lock();
                    let Some(id) = status.id.clone() else {
                        warn!(target: "peerlink::peer", "OPEN without an identity");
                        return;
                    };
                    status.last_server_id = Some(id.clone());
                    status.state = PeerState::Open;
                    id
                };
                info!(target: "peerlink::peer", %id, "signaling open");
                self.emit(PeerEvent::Open(id));
            }
            MessageType::Error => {
                let msg = message
                    .payload
                    .and_then(|payload| payload.msg)
                    .unwrap_or_else(|| "Unknown server error".to_string());
                self.abort(ErrorKind::ServerError, msg);
            }
            MessageType::IdTaken => {
                let id = self.status.lock().id.clone().unwrap_or_default();
                self.abort(ErrorKind::UnavailableId, format!("ID \"{id}\" is taken"));
            }
            MessageType::InvalidKey => {
                self.abort(
                    ErrorKind::InvalidKey,
                    format!("API KEY \"{}\" is invalid", self.options.key),
                );
            }
            MessageType::Leave => match peer {
                Some(peer) => {
                    debug!(target: "peerlink::peer", %peer, "received leave message");
                    self.cleanup_peer(&peer);
                }
                None => warn!(target: "peerlink::peer", "LEAVE without a source"),
            },
            MessageType::Expire => {
                let peer = peer.unwrap_or_default();
                self.emit_error(
                    ErrorKind::PeerUnavailable,
                    format!("Could not connect to peer {peer}"),
                );
            }
            MessageType::Offer => self.handle_offer(message),
            MessageType::Heartbeat => {}
            _ => self.route(message),
        }
    }

    fn handle_offer(&self, message: ServerMessage) {
        let (Some(peer), Some(payload)) = (message.src, message.payload) else {
            warn!(target: "peerlink::peer", "malformed OFFER dropped");
            return;
        };
        let Some(connection_id) = payload.connection_id.clone() else {
            warn!(target: "peerlink::peer", %peer, "OFFER without a connection id");
            return;
        };
        if let Some(existing) = self.connection(&peer, &connection_id) {
            warn!(
                target: "peerlink::peer",
                %peer,
                %connection_id,
                "offer received for existing connection id; replacing it"
            );
            existing.close();
        }
        let Some(host) = self.host() else {
            return;
        };
        let kind = payload.connection_type.as_deref().and_then(ConnectionKind::parse);
        let remote_sdp = payload.sdp.as_ref().map(|sdp| sdp.sdp.clone());
        let connection = match kind {
            Some(ConnectionKind::Media) => {
                let options = MediaOptions {
                    connection_id: Some(connection_id.clone()),
                    metadata: payload.metadata.clone(),
                    ..Default::default()
                };
                let call = MediaConnection::new(peer.clone(), None, options, remote_sdp, &host);
                self.add_connection(Connection::Media(call.clone()));
                self.emit(PeerEvent::Call(call.clone()));
                Connection::Media(call)
            }
            Some(ConnectionKind::Data) => {
                let options = DataConnectionOptions::from_offer(&payload);
                let data = DataConnection::new(peer.clone(), options, remote_sdp, &host);
                self.add_connection(Connection::Data(data.clone()));
                data.start();
                self.emit(PeerEvent::Connection(data.clone()));
                Connection::Data(data)
            }
            None => {
                warn!(
                    target: "peerlink::peer",
                    %peer,
                    connection_type = ?payload.connection_type,
                    "received malformed connection type"
                );
                return;
            }
        };
        // a media call drains its own backlog once answered
        if connection.has_negotiator() {
            let lost = self.lost.lock().take(&connection_id);
            for message in lost {
                connection.handle_message(message);
            }
        }
    }

    fn route(&self, message: ServerMessage) {
        let Some(payload) = &message.payload else {
            warn!(
                target: "peerlink::peer",
                src = ?message.src,
                message_type = ?message.kind,
                "malformed message without payload"
            );
            return;
        };
        let Some(connection_id) = payload.connection_id.clone() else {
            warn!(
                target: "peerlink::peer",
                src = ?message.src,
                message_type = ?message.kind,
                "unrecognized message"
            );
            return;
        };
        let peer = message.src.clone().unwrap_or_default();
        match self.connection(&peer, &connection_id) {
            Some(connection) if connection.has_negotiator() => connection.handle_message(message),
            _ => {
                debug!(
                    target: "peerlink::peer",
                    %peer,
                    %connection_id,
                    "storing message for unknown connection"
                );
                self.lost.lock().store(&connection_id, message);
            }
        }
    }

    fn cleanup_peer(&self, peer: &str) {
        let connections = self.registry.lock().get(peer).cloned().unwrap_or_default();
        for connection in connections {
            connection.close();
        }
        self.registry.lock().remove(peer);
    }

    fn disconnect(&self) {
        let current = {
            let mut status = self.status.lock();
            if matches!(status.state, PeerState::Disconnected | PeerState::Destroyed) {
                return;
            }
            status.state = PeerState::Disconnected;
            let current = status.id.take();
            status.last_server_id = current.clone();
            current
        };
        if let Some(task) = self.id_task.lock().take() {
            task.abort();
        }
        info!(target: "peerlink::peer", id = ?current, "disconnecting from server");
        self.socket.close();
        self.emit(PeerEvent::Disconnected(current));
    }

    fn reconnect(&self) {
        let last = {
            let mut status = self.status.lock();
            match status.state {
                PeerState::Destroyed => None,
                PeerState::Disconnected => {
                    status.state = PeerState::Initializing;
                    Some(status.last_server_id.clone())
                }
                state => {
                    warn!(
                        target: "peerlink::peer",
                        ?state,
                        id = ?status.id,
                        "cannot reconnect; peer is not disconnected"
                    );
                    return;
                }
            }
        };
        match last {
            None => self.emit_error(
                ErrorKind::Disconnected,
                "This peer cannot reconnect to the server. It has already been destroyed.",
            ),
            Some(last) => {
                info!(target: "peerlink::peer", id = ?last, "attempting reconnection to server");
                self.obtain_identity(last);
            }
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.id_task.lock().take() {
            task.abort();
        }
        let connections: Vec<Connection> = self
            .registry
            .lock()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        for connection in connections {
            connection.close();
        }
        self.registry.lock().clear();
        self.lost.lock().clear();
        self.socket.remove_listener();
        self.disconnect();
        self.status.lock().state = PeerState::Destroyed;
        info!(target: "peerlink::peer", "peer destroyed");
        self.emit(PeerEvent::Close);
    }
}

impl SocketListener for PeerInner {
    fn on_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Message(message) => self.handle_message(message),
            SocketEvent::Error(message) => self.abort(ErrorKind::SocketError, message),
            SocketEvent::Disconnected => {
                if self.is_disconnected() {
                    return;
                }
                self.emit_error(ErrorKind::Network, "Lost connection to server.");
                self.disconnect();
            }
            SocketEvent::Closed => {
                if self.is_disconnected() {
                    return;
                }
                self.abort(ErrorKind::SocketClosed, "Underlying socket is already closed.");
            }
        }
    }
}

impl ConnectionHost for PeerInner {
    fn send_signal(&self, message: ServerMessage) {
        self.socket.send(&message);
    }

    fn remove_connection(&self, peer: &str, connection_id: &str, serial: u64) {
        {
            let mut registry = self.registry.lock();
            if let Some(list) = registry.get_mut(peer) {
                list.retain(|connection| {
                    connection.connection_id() != connection_id || connection.serial() != serial
                });
                if list.is_empty() {
                    registry.remove(peer);
                }
            }
        }
        self.lost.lock().discard(connection_id);
    }

    fn take_lost_messages(&self, connection_id: &str) -> Vec<ServerMessage> {
        self.lost.lock().take(connection_id)
    }

    fn provider(&self) -> Arc<dyn TransportProvider> {
        Arc::clone(&self.provider)
    }

    fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    fn transport_config(&self) -> TransportConfig {
        self.options.transport.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataValue;
    use crate::connection::{AnswerOptions, ConnectionEvent};
    use crate::connection::test_support::drain as drain_connection;
    use crate::error::ConnectionError;
    use crate::provider::{Capabilities, IceCandidate, MemoryProvider, SdpKind, SessionDescription};
    use crate::signaling::{MemoryConnector, MemoryLinkHandle, MessagePayload};

    struct TestPeer {
        peer: Peer,
        connector: MemoryConnector,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl TestPeer {
        fn new(id: &str, provider: &MemoryProvider) -> Self {
            let options = PeerOptions::new("localhost", 9000)
                .with_identity(id)
                .with_token("tok");
            Self::with_options(options, provider)
        }

        fn with_options(options: PeerOptions, provider: &MemoryProvider) -> Self {
            let connector = MemoryConnector::new();
            let peer = Peer::builder(options, provider.clone())
                .connector(connector.clone())
                .build();
            let events = peer.events().expect("events");
            Self {
                peer,
                connector,
                events,
            }
        }

        fn link(&self) -> MemoryLinkHandle {
            self.connector.last_link().expect("signaling link")
        }

        /// Open the link and confirm the identity the way the server does.
        fn go_online(&mut self) {
            let link = self.link();
            link.open();
            link.deliver_message(&ServerMessage::new(MessageType::Open));
            let id = self.peer.id().expect("identity");
            assert_eq!(self.drain(), vec![PeerEvent::Open(id)]);
        }

        fn drain(&mut self) -> Vec<PeerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn error_kinds(&mut self) -> Vec<ErrorKind> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    PeerEvent::Error(error) => Some(error.kind),
                    _ => None,
                })
                .collect()
        }
    }

    /// Forward everything `from` wrote to `to`, stamped with the sender's id.
    fn relay(from: &TestPeer, to: &TestPeer) -> Vec<MessageType> {
        let src = from.peer.id().expect("sender identity");
        from.link()
            .take_sent()
            .into_iter()
            .filter(|message| message.kind != MessageType::Heartbeat)
            .map(|message| {
                let kind = message.kind;
                to.link().deliver_message(&message.with_src(src.clone()));
                kind
            })
            .collect()
    }

    fn online_pair() -> (TestPeer, TestPeer, MemoryProvider) {
        let provider = MemoryProvider::new();
        let mut alice = TestPeer::new("alice", &provider);
        let mut bob = TestPeer::new("bob", &provider);
        alice.go_online();
        bob.go_online();
        (alice, bob, provider)
    }

    fn incoming_connection(events: Vec<PeerEvent>) -> DataConnection {
        events
            .into_iter()
            .find_map(|event| match event {
                PeerEvent::Connection(connection) => Some(connection),
                _ => None,
            })
            .expect("connection event")
    }

    fn offer_from(src: &str, connection_id: &str, kind: &str) -> ServerMessage {
        ServerMessage::new(MessageType::Offer)
            .with_src(src)
            .with_dst("bob")
            .with_payload(MessagePayload {
                connection_id: Some(connection_id.to_string()),
                connection_type: Some(kind.to_string()),
                sdp: Some(SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                }),
                serialization: Some("json".into()),
                ..Default::default()
            })
    }

    fn candidate_from(src: &str, connection_id: &str, n: u32) -> ServerMessage {
        ServerMessage::new(MessageType::Candidate)
            .with_src(src)
            .with_payload(MessagePayload {
                connection_id: Some(connection_id.to_string()),
                candidate: Some(IceCandidate::new(format!("candidate:{n}"))),
                ..Default::default()
            })
    }

    #[test]
    fn connect_returns_pending_connection_that_opens_after_handshake() {
        let provider = MemoryProvider::new();
        let mut alice = TestPeer::new("alice", &provider);
        let mut bob = TestPeer::new("bob", &provider);
        assert_eq!(alice.peer.state(), PeerState::Initializing);
        assert_eq!(
            alice.link().url().as_str(),
            "ws://localhost:9000/peerjs?key=peerjs&id=alice&token=tok"
        );

        let connection = alice
            .peer
            .connect("bob", DataConnectionOptions::default())
            .expect("connection");
        assert!(connection.connection_id().starts_with("dc_"));
        assert!(!connection.is_open());
        let mut connection_events = connection.events().unwrap();
        connection.send("too early");
        assert_eq!(
            drain_connection(&mut connection_events),
            vec![ConnectionEvent::Error(ConnectionError::NotOpen)]
        );
        assert!(alice.link().sent().is_empty());

        alice.go_online();
        bob.go_online();
        assert!(alice.peer.is_open());
        assert_eq!(
            relay(&alice, &bob),
            vec![MessageType::Offer, MessageType::Candidate]
        );
        let incoming = incoming_connection(bob.drain());
        assert_eq!(incoming.connection_id(), connection.connection_id());
        assert_eq!(incoming.peer(), "alice");
        let mut incoming_events = incoming.events().unwrap();

        assert_eq!(
            relay(&bob, &alice),
            vec![MessageType::Answer, MessageType::Candidate]
        );
        assert!(connection.is_open());
        assert!(incoming.is_open());
        assert_eq!(
            provider.applied_candidates(connection.connection_id(), true).len(),
            1
        );

        connection.send("hi!");
        assert_eq!(
            drain_connection(&mut connection_events),
            vec![ConnectionEvent::Open]
        );
        assert_eq!(
            drain_connection(&mut incoming_events),
            vec![
                ConnectionEvent::Open,
                ConnectionEvent::Data(DataValue::from("hi!"))
            ]
        );
        assert_eq!(alice.peer.connections()["bob"].len(), 1);
        assert_eq!(bob.peer.connections()["alice"].len(), 1);
    }

    #[test]
    fn offer_for_existing_connection_id_replaces_it() {
        let (_alice, mut bob, _) = online_pair();
        bob.link().deliver_message(&offer_from("alice", "dc_shared", "data"));
        let first = incoming_connection(bob.drain());
        bob.link().deliver_message(&offer_from("alice", "dc_shared", "data"));
        let second = incoming_connection(bob.drain());

        assert!(!first.same_connection(&second));
        assert!(first.core().is_closed());
        let registered = bob.peer.connections();
        assert_eq!(registered["alice"].len(), 1);
        let current = bob.peer.connection("alice", "dc_shared").unwrap();
        assert!(current.as_data().unwrap().same_connection(&second));
        assert_eq!(second.serialization(), crate::connection::Serialization::Json);
    }

    #[test]
    fn messages_before_offer_are_delivered_once_in_order() {
        let (_alice, mut bob, provider) = online_pair();
        for n in 0..3 {
            bob.link().deliver_message(&candidate_from("alice", "dc_early", n));
        }
        assert_eq!(bob.inner_lost_pending("dc_early"), 3);

        bob.link().deliver_message(&offer_from("alice", "dc_early", "data"));
        incoming_connection(bob.drain());
        bob.link().deliver_message(&candidate_from("alice", "dc_early", 3));

        let applied: Vec<String> = provider
            .applied_candidates("dc_early", false)
            .into_iter()
            .map(|candidate| candidate.candidate)
            .collect();
        assert_eq!(
            applied,
            ["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
        assert_eq!(bob.inner_lost_pending("dc_early"), 0);
    }

    impl TestPeer {
        fn inner_lost_pending(&self, connection_id: &str) -> usize {
            self.peer.inner.lost.lock().pending(connection_id)
        }
    }

    #[test]
    fn incoming_call_keeps_candidates_until_answered() {
        let (mut alice, mut bob, provider) = online_pair();
        let camera = MediaStream::empty("alice-cam");
        let call = alice
            .peer
            .call("bob", Some(camera.clone()), MediaOptions::default())
            .expect("call");
        let mut call_events = call.events().unwrap();
        relay(&alice, &bob);
        let incoming = bob
            .drain()
            .into_iter()
            .find_map(|event| match event {
                PeerEvent::Call(call) => Some(call),
                _ => None,
            })
            .expect("call event");
        assert_eq!(bob.inner_lost_pending(call.connection_id()), 1);

        let speaker = MediaStream::empty("bob-cam");
        incoming.answer(speaker.clone(), AnswerOptions::default());
        assert_eq!(bob.inner_lost_pending(call.connection_id()), 0);
        assert_eq!(
            provider.applied_candidates(call.connection_id(), false).len(),
            1
        );
        relay(&bob, &alice);

        assert!(call.is_open());
        assert_eq!(call.remote_stream(), Some(speaker.clone()));
        assert_eq!(incoming.remote_stream(), Some(camera));
        assert_eq!(
            drain_connection(&mut call_events),
            vec![ConnectionEvent::Stream(speaker), ConnectionEvent::Open]
        );
        assert!(alice.error_kinds().is_empty());
    }

    #[test]
    fn call_without_stream_is_rejected_without_traffic() {
        let (mut alice, _bob, _) = online_pair();
        assert!(alice.peer.call("bob", None, MediaOptions::default()).is_none());
        assert_eq!(alice.error_kinds(), vec![ErrorKind::InvalidStream]);
        assert!(alice.link().take_sent().is_empty());
        assert!(alice.peer.connections().is_empty());
    }

    #[test]
    fn leave_closes_every_connection_of_the_source() {
        let (mut alice, mut bob, _) = online_pair();
        let first = alice.peer.connect("bob", DataConnectionOptions::default()).unwrap();
        let second = alice.peer.connect("bob", DataConnectionOptions::default()).unwrap();
        relay(&alice, &bob);
        relay(&bob, &alice);
        assert!(first.is_open() && second.is_open());
        bob.drain();

        alice
            .link()
            .deliver_message(&ServerMessage::new(MessageType::Leave).with_src("bob"));
        assert!(!first.is_open());
        assert!(!second.is_open());
        assert!(alice.peer.connections().is_empty());
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn expire_reports_unavailable_peer_only() {
        let (mut alice, _bob, _) = online_pair();
        alice
            .link()
            .deliver_message(&ServerMessage::new(MessageType::Expire).with_src("carol"));
        let events = alice.drain();
        assert_eq!(
            events,
            vec![PeerEvent::Error(PeerError::new(
                ErrorKind::PeerUnavailable,
                "Could not connect to peer carol"
            ))]
        );
        assert!(alice.peer.is_open());
    }

    #[test]
    fn destroy_is_idempotent_and_closes_everything() {
        let (mut alice, mut bob, _) = online_pair();
        let connection = alice.peer.connect("bob", DataConnectionOptions::default()).unwrap();
        let mut connection_events = connection.events().unwrap();
        relay(&alice, &bob);
        relay(&bob, &alice);
        bob.drain();
        drain_connection(&mut connection_events);

        alice.peer.destroy();
        alice.peer.destroy();
        assert_eq!(
            alice.drain(),
            vec![
                PeerEvent::Disconnected(Some("alice".into())),
                PeerEvent::Close
            ]
        );
        assert_eq!(
            drain_connection(&mut connection_events),
            vec![ConnectionEvent::Close]
        );
        assert!(alice.peer.is_destroyed());
        assert!(alice.peer.is_disconnected());
        assert!(alice.peer.connections().is_empty());
        assert!(alice.link().is_closed());

        assert!(alice.peer.connect("bob", DataConnectionOptions::default()).is_none());
        alice.peer.reconnect();
        assert_eq!(
            alice.error_kinds(),
            vec![ErrorKind::Disconnected, ErrorKind::Disconnected]
        );
    }

    #[test]
    fn invalid_identity_aborts_and_destroys() {
        let provider = MemoryProvider::new();
        let options = PeerOptions::new("localhost", 9000).with_identity("bad id!");
        let mut peer = TestPeer::with_options(options, &provider);
        let events = peer.drain();
        assert!(matches!(
            &events[0],
            PeerEvent::Error(error) if error.kind == ErrorKind::InvalidId
        ));
        assert_eq!(events.last(), Some(&PeerEvent::Close));
        assert!(peer.peer.is_destroyed());
        assert!(peer.connector.links().is_empty());
    }

    #[test]
    fn provider_without_capabilities_is_incompatible() {
        let provider = MemoryProvider::with_capabilities(Capabilities::none());
        let mut peer = TestPeer::new("alice", &provider);
        assert_eq!(peer.error_kinds(), vec![ErrorKind::Incompatible]);
        assert!(peer.peer.is_destroyed());
        assert!(peer.connector.links().is_empty());
    }

    #[test]
    fn taken_id_before_open_destroys_the_peer() {
        let provider = MemoryProvider::new();
        let mut alice = TestPeer::new("alice", &provider);
        alice.link().open();
        alice
            .link()
            .deliver_message(&ServerMessage::new(MessageType::IdTaken));
        let events = alice.drain();
        assert_eq!(
            events,
            vec![
                PeerEvent::Error(PeerError::new(ErrorKind::UnavailableId, "ID \"alice\" is taken")),
                PeerEvent::Disconnected(Some("alice".into())),
                PeerEvent::Close,
            ]
        );
        assert!(alice.peer.is_destroyed());
    }

    #[test]
    fn server_error_after_open_only_disconnects() {
        let (mut alice, _bob, _) = online_pair();
        alice.link().deliver_message(
            &ServerMessage::new(MessageType::Error).with_payload(MessagePayload {
                msg: Some("boom".into()),
                ..Default::default()
            }),
        );
        assert_eq!(
            alice.drain(),
            vec![
                PeerEvent::Error(PeerError::new(ErrorKind::ServerError, "boom")),
                PeerEvent::Disconnected(Some("alice".into())),
            ]
        );
        assert_eq!(alice.peer.state(), PeerState::Disconnected);
        assert!(alice.peer.id().is_none());
    }

    #[test]
    fn lost_link_disconnects_and_reconnect_reuses_the_identity() {
        let (mut alice, _bob, _) = online_pair();
        alice.link().drop_link();
        assert_eq!(
            alice.drain(),
            vec![
                PeerEvent::Error(PeerError::new(ErrorKind::Network, "Lost connection to server.")),
                PeerEvent::Disconnected(Some("alice".into())),
            ]
        );
        assert!(alice.peer.is_disconnected());

        alice.peer.disconnect();
        assert!(alice.drain().is_empty());

        alice.peer.reconnect();
        assert_eq!(alice.connector.links().len(), 2);
        assert!(alice.link().url().as_str().contains("id=alice"));
        alice.go_online();
        assert!(alice.peer.is_open());
    }

    #[test]
    fn link_closed_before_open_aborts() {
        let provider = MemoryProvider::new();
        let mut alice = TestPeer::new("alice", &provider);
        alice.link().drop_link();
        let kinds = alice.error_kinds();
        assert_eq!(kinds, vec![ErrorKind::SocketClosed]);
        assert!(alice.peer.is_destroyed());
    }

    #[test]
    fn empty_identity_without_runtime_reports_server_error() {
        let provider = MemoryProvider::new();
        let options = PeerOptions::new("localhost", 9000).with_identity("");
        let mut peer = TestPeer::with_options(options, &provider);
        assert_eq!(peer.error_kinds(), vec![ErrorKind::ServerError]);
        assert!(peer.connector.links().is_empty());
    }

    #[test]
    fn identity_arriving_after_disconnect_is_ignored() {
        let (mut alice, _bob, _) = online_pair();
        alice.peer.disconnect();
        assert_eq!(alice.drain(), vec![PeerEvent::Disconnected(Some("alice".into()))]);

        alice.peer.inner.initialize("late-id".into());
        assert_eq!(alice.connector.links().len(), 1);
        assert_eq!(alice.peer.state(), PeerState::Disconnected);
        assert!(alice.peer.id().is_none());
        assert!(alice.drain().is_empty());

        alice.peer.reconnect();
        assert_eq!(alice.connector.links().len(), 2);
        alice.go_online();
        assert_eq!(alice.peer.id().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn disconnect_during_identity_fetch_keeps_the_peer_offline() {
        use std::time::Duration;
        use tokio::sync::Notify;

        let requested = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let app = axum::Router::new().route(
            "/peerjs/id",
            axum::routing::get({
                let requested = Arc::clone(&requested);
                let gate = Arc::clone(&gate);
                move || {
                    let requested = Arc::clone(&requested);
                    let gate = Arc::clone(&gate);
                    async move {
                        requested.notify_one();
                        gate.notified().await;
                        "late-id"
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind id server");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let provider = MemoryProvider::new();
        let mut peer = TestPeer::with_options(PeerOptions::new("127.0.0.1", port), &provider);
        tokio::time::timeout(Duration::from_secs(5), requested.notified())
            .await
            .expect("identity requested");

        peer.peer.disconnect();
        assert_eq!(peer.peer.state(), PeerState::Disconnected);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(peer.connector.links().is_empty());
        assert!(peer.peer.id().is_none());
        assert_eq!(peer.peer.state(), PeerState::Disconnected);
        assert_eq!(peer.drain(), vec![PeerEvent::Disconnected(None)]);
    }

    #[test]
    fn unknown_messages_without_connection_id_are_not_stored() {
        let (mut alice, _bob, _) = online_pair();
        alice.link().deliver_message(
            &ServerMessage::new(MessageType::Answer)
                .with_src("bob")
                .with_payload(MessagePayload::default()),
        );
        alice
            .link()
            .deliver_message(&ServerMessage::new(MessageType::Candidate).with_src("bob"));
        assert!(alice.peer.inner.lost.lock().is_empty());
        assert!(alice.drain().is_empty());
    }
}

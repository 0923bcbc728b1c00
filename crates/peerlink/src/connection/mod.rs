//! Logical connections to a remote peer and the state they share.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::{Codec, DataValue};
use crate::config::TransportConfig;
use crate::error::ConnectionError;
use crate::provider::{MediaStream, TransportProvider};
use crate::signaling::ServerMessage;

pub mod data;
pub mod media;
pub(crate) mod negotiator;

pub use data::{DataConnection, DataConnectionOptions, Serialization};
pub use media::{AnswerOptions, MediaConnection, MediaOptions};
pub use negotiator::SdpTransform;

use negotiator::Negotiator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Data,
    Media,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Data => "data",
            ConnectionKind::Media => "media",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data" => Some(ConnectionKind::Data),
            "media" => Some(ConnectionKind::Media),
            _ => None,
        }
    }

    pub(crate) fn id_prefix(self) -> &'static str {
        match self {
            ConnectionKind::Data => "dc_",
            ConnectionKind::Media => "mc_",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Data(DataValue),
    Stream(MediaStream),
    Close,
    Error(ConnectionError),
}

/// What a connection needs from the peer that owns it.
pub(crate) trait ConnectionHost: Send + Sync {
    fn send_signal(&self, message: ServerMessage);
    fn remove_connection(&self, peer: &str, connection_id: &str, serial: u64);
    fn take_lost_messages(&self, connection_id: &str) -> Vec<ServerMessage>;
    fn provider(&self) -> Arc<dyn TransportProvider>;
    fn codec(&self) -> Arc<dyn Codec>;
    fn transport_config(&self) -> TransportConfig;
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// State common to data and media connections.
pub(crate) struct ConnectionCore {
    connection_id: String,
    peer: String,
    kind: ConnectionKind,
    metadata: Option<Value>,
    serial: u64,
    open: AtomicBool,
    closed: AtomicBool,
    host: Mutex<Option<Weak<dyn ConnectionHost>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    negotiator: Mutex<Option<Arc<Negotiator>>>,
}

impl ConnectionCore {
    pub(crate) fn new(
        kind: ConnectionKind,
        peer: String,
        connection_id: Option<String>,
        metadata: Option<Value>,
        host: Weak<dyn ConnectionHost>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connection_id: connection_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| crate::identity::connection_id(kind.id_prefix())),
            peer,
            kind,
            metadata,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            host: Mutex::new(Some(host)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            negotiator: Mutex::new(None),
        }
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub(crate) fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_open(&self, open: bool) -> bool {
        self.open.swap(open, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True for the first caller only.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    pub(crate) fn host(&self) -> Option<Arc<dyn ConnectionHost>> {
        self.host.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Leave the owning peer's registry.
    pub(crate) fn deregister(&self) {
        let host = self.host.lock().take().and_then(|host| host.upgrade());
        if let Some(host) = host {
            host.remove_connection(&self.peer, &self.connection_id, self.serial);
        }
    }

    pub(crate) fn send_signal(&self, message: ServerMessage) {
        if let Some(host) = self.host() {
            host.send_signal(message);
        }
    }

    pub(crate) fn negotiator(&self) -> Option<Arc<Negotiator>> {
        self.negotiator.lock().clone()
    }

    pub(crate) fn has_negotiator(&self) -> bool {
        self.negotiator.lock().is_some()
    }

    /// Store the running negotiator, or tear it down if the connection
    /// already closed while the handshake was starting.
    pub(crate) fn install_negotiator(&self, negotiator: Arc<Negotiator>) {
        let mut slot = self.negotiator.lock();
        if self.is_closed() {
            drop(slot);
            negotiator.cleanup();
            return;
        }
        let previous = slot.replace(negotiator);
        drop(slot);
        if let Some(previous) = previous {
            previous.cleanup();
        }
    }

    pub(crate) fn teardown_negotiator(&self) {
        let negotiator = self.negotiator.lock().take();
        if let Some(negotiator) = negotiator {
            negotiator.cleanup();
        }
    }
}

/// A registered connection of either kind.
#[derive(Clone, Debug)]
pub enum Connection {
    Data(DataConnection),
    Media(MediaConnection),
}

impl Connection {
    fn core(&self) -> &ConnectionCore {
        match self {
            Connection::Data(connection) => connection.core(),
            Connection::Media(connection) => connection.core(),
        }
    }

    pub fn connection_id(&self) -> &str {
        self.core().connection_id()
    }

    pub fn peer(&self) -> &str {
        self.core().peer()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.core().kind()
    }

    pub fn is_open(&self) -> bool {
        self.core().is_open()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.core().metadata()
    }

    pub fn close(&self) {
        match self {
            Connection::Data(connection) => connection.close(),
            Connection::Media(connection) => connection.close(),
        }
    }

    pub fn as_data(&self) -> Option<&DataConnection> {
        match self {
            Connection::Data(connection) => Some(connection),
            Connection::Media(_) => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaConnection> {
        match self {
            Connection::Media(connection) => Some(connection),
            Connection::Data(_) => None,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.core().serial
    }

    pub(crate) fn has_negotiator(&self) -> bool {
        self.core().has_negotiator()
    }

    pub(crate) fn handle_message(&self, message: ServerMessage) {
        match self {
            Connection::Data(connection) => connection.handle_message(message),
            Connection::Media(connection) => connection.handle_message(message),
        }
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    LinkListener, MessageType, ServerMessage, SignalingConnector, SignalingLink, socket_base_url,
    socket_url,
};
use crate::config::PeerOptions;
use crate::error::SignalingError;

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(ServerMessage),
    /// A message was rejected locally; the link is still usable.
    Error(String),
    /// The link closed after it had opened.
    Disconnected,
    /// The link closed before it ever opened.
    Closed,
}

pub trait SocketListener: Send + Sync {
    fn on_socket_event(&self, event: SocketEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct SocketState {
    phase: Phase,
    link: Option<Arc<dyn SignalingLink>>,
    generation: u64,
    queue: VecDeque<Value>,
    draining: bool,
    heartbeat: Option<JoinHandle<()>>,
}

struct SocketInner {
    base_url: String,
    heartbeat_interval: Duration,
    connector: Arc<dyn SignalingConnector>,
    state: Mutex<SocketState>,
    listener: Mutex<Option<Weak<dyn SocketListener>>>,
}

/// Persistent message channel to one signaling endpoint. Never reconnects on
/// its own; the owner decides what to do with `Disconnected`/`Closed`.
pub struct SignalingSocket {
    inner: Arc<SocketInner>,
}

enum Outcome {
    Queued,
    Dropped,
    Write(Value),
}

impl SignalingSocket {
    pub fn new(options: &PeerOptions, connector: Arc<dyn SignalingConnector>) -> Self {
        let base_url = socket_base_url(
            options.secure,
            &options.host,
            options.port,
            &options.normalized_path(),
            &options.key,
        );
        Self::with_base_url(base_url, options.heartbeat_interval, connector)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        heartbeat_interval: Duration,
        connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                base_url: base_url.into(),
                heartbeat_interval,
                connector,
                state: Mutex::new(SocketState {
                    phase: Phase::Idle,
                    link: None,
                    generation: 0,
                    queue: VecDeque::new(),
                    draining: false,
                    heartbeat: None,
                }),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn SocketListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    pub fn remove_listener(&self) {
        self.inner.listener.lock().take();
    }

    /// Open the link for `id`. No-op while a link is connecting or open.
    pub fn start(&self, id: &str, token: &str) -> Result<(), SignalingError> {
        let url = socket_url(&self.inner.base_url, id, token)?;
        let mut state = self.inner.state.lock();
        if state.link.is_some() || matches!(state.phase, Phase::Connecting | Phase::Open) {
            return Ok(());
        }
        state.generation += 1;
        let listener = Arc::new(LinkHandler {
            socket: Arc::downgrade(&self.inner),
            generation: state.generation,
        });
        debug!(target: "peerlink::signaling", %id, "opening signaling link");
        let link = self.inner.connector.connect(url, listener)?;
        state.link = Some(link);
        state.phase = Phase::Connecting;
        Ok(())
    }

    /// Best-effort send. Queued until the link opens; dropped after `close()`
    /// or while the open link is not writable.
    pub fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_value(message) {
            Ok(value) => self.inner.send_value(value),
            Err(err) => self
                .inner
                .emit(SocketEvent::Error(format!("Invalid message: {err}"))),
        }
    }

    /// Idempotent. Detaches and closes the link and cancels the heartbeat.
    pub fn close(&self) {
        let link = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            self.inner.teardown(&mut state)
        };
        debug!(target: "peerlink::signaling", "signaling socket closed");
        if let Some(link) = link {
            link.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().phase == Phase::Open
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Idle | Phase::Closed)
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl SocketInner {
    fn emit(&self, event: SocketEvent) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.on_socket_event(event),
            None => trace!(target: "peerlink::signaling", ?event, "no socket listener"),
        }
    }

    fn teardown(&self, state: &mut SocketState) -> Option<Arc<dyn SignalingLink>> {
        state.phase = Phase::Closed;
        state.generation += 1;
        state.queue.clear();
        state.draining = false;
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }
        state.link.take()
    }

    fn send_value(&self, value: Value) {
        let outcome = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Closed => Outcome::Dropped,
                Phase::Idle | Phase::Connecting => {
                    state.queue.push_back(value);
                    Outcome::Queued
                }
                Phase::Open if state.draining => {
                    state.queue.push_back(value);
                    Outcome::Queued
                }
                Phase::Open => Outcome::Write(value),
            }
        };
        match outcome {
            Outcome::Write(value) => self.write(value),
            Outcome::Queued => trace!(target: "peerlink::signaling", "queued signaling message"),
            Outcome::Dropped => trace!(target: "peerlink::signaling", "socket closed; dropping message"),
        }
    }

    fn write(&self, value: Value) {
        if value.get("type").and_then(Value::as_str).is_none() {
            self.emit(SocketEvent::Error("Invalid message".to_string()));
            return;
        }
        let link = {
            let state = self.state.lock();
            match &state.link {
                Some(link) if link.is_writable() => Arc::clone(link),
                _ => {
                    trace!(target: "peerlink::signaling", "link not writable; dropping message");
                    return;
                }
            }
        };
        let text = value.to_string();
        trace!(target: "peerlink::signaling", len = text.len(), "ws_out");
        if let Err(err) = link.send_text(text) {
            warn!(target: "peerlink::signaling", error = %err, "signaling write failed");
        }
    }

    fn link_opened(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase != Phase::Connecting {
                return;
            }
            state.phase = Phase::Open;
            state.draining = true;
        }
        debug!(target: "peerlink::signaling", "signaling link open");
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                match state.queue.pop_front() {
                    Some(value) => value,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            self.write(next);
        }
        self.schedule_heartbeat(generation);
    }

    fn schedule_heartbeat(self: &Arc<Self>, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "peerlink::signaling", "no tokio runtime; heartbeat disabled");
            return;
        };
        let socket = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        let task = runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(socket) = socket.upgrade() else {
                    break;
                };
                if !socket.send_heartbeat(generation) {
                    break;
                }
            }
        });
        let mut state = self.state.lock();
        if state.generation == generation {
            if let Some(previous) = state.heartbeat.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }

    fn send_heartbeat(&self, generation: u64) -> bool {
        let link = {
            let state = self.state.lock();
            if state.generation != generation || state.phase != Phase::Open {
                return false;
            }
            match &state.link {
                Some(link) if link.is_writable() => Arc::clone(link),
                _ => {
                    debug!(target: "peerlink::signaling", "cannot send heartbeat; link not writable");
                    return false;
                }
            }
        };
        match serde_json::to_string(&ServerMessage::new(MessageType::Heartbeat)) {
            Ok(text) => link.send_text(text).is_ok(),
            Err(_) => false,
        }
    }

    fn link_message(&self, generation: u64, text: String) {
        {
            let state = self.state.lock();
            if state.generation != generation || state.phase == Phase::Closed {
                return;
            }
        }
        trace!(target: "peerlink::signaling", len = text.len(), "ws_in");
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(message) => self.emit(SocketEvent::Message(message)),
            Err(err) => {
                debug!(target: "peerlink::signaling", error = %err, "invalid server message")
            }
        }
    }

    fn link_closed(&self, generation: u64) {
        let was_open = {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase == Phase::Closed {
                return;
            }
            let was_open = state.phase == Phase::Open;
            self.teardown(&mut state);
            was_open
        };
        if was_open {
            warn!(target: "peerlink::signaling", "signaling link lost");
            self.emit(SocketEvent::Disconnected);
        } else {
            warn!(target: "peerlink::signaling", "signaling link closed before opening");
            self.emit(SocketEvent::Closed);
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.state.get_mut().heartbeat.take() {
            heartbeat.abort();
        }
    }
}

struct LinkHandler {
    socket: Weak<SocketInner>,
    generation: u64,
}

impl LinkListener for LinkHandler {
    fn opened(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.link_opened(self.generation);
        }
    }

    fn message(&self, text: String) {
        if let Some(socket) = self.socket.upgrade() {
            socket.link_message(self.generation, text);
        }
    }

    fn closed(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.link_closed(self.generation);
        }
    }
}

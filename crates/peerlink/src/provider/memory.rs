//! In-process loopback provider. Two peers sharing one `MemoryProvider`
//! (or clones of it) are paired by connection id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    Capabilities, ChannelListener, DataChannel, Frame, IceCandidate, MediaStream, Negotiation,
    NegotiationEvents, NegotiationRequest, SdpKind, TransportProvider,
};
use crate::connection::ConnectionKind;
use crate::error::ChannelError;

#[derive(Clone)]
pub struct MemoryProvider {
    hub: Arc<Mutex<Hub>>,
    capabilities: Capabilities,
}

#[derive(Default)]
struct Hub {
    pairings: HashMap<String, Pairing>,
    failing: HashSet<String>,
}

#[derive(Default)]
struct Pairing {
    offerer: Option<Side>,
    answerer: Option<Side>,
}

impl Pairing {
    fn side_mut(&mut self, originator: bool) -> &mut Option<Side> {
        if originator {
            &mut self.offerer
        } else {
            &mut self.answerer
        }
    }

    fn side(&self, originator: bool) -> Option<&Side> {
        if originator {
            self.offerer.as_ref()
        } else {
            self.answerer.as_ref()
        }
    }
}

struct Side {
    events: Arc<dyn NegotiationEvents>,
    stream: Option<MediaStream>,
    channel: Option<Arc<MemoryChannel>>,
    candidates: Vec<IceCandidate>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::full())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            capabilities,
        }
    }

    /// Every later negotiation for `connection_id` reports failure.
    pub fn fail_connection(&self, connection_id: impl Into<String>) {
        self.hub.lock().failing.insert(connection_id.into());
    }

    pub fn channel(&self, connection_id: &str, originator: bool) -> Option<Arc<MemoryChannel>> {
        let hub = self.hub.lock();
        hub.pairings
            .get(connection_id)
            .and_then(|pairing| pairing.side(originator))
            .and_then(|side| side.channel.clone())
    }

    /// Remote candidates applied to one side, in arrival order.
    pub fn applied_candidates(&self, connection_id: &str, originator: bool) -> Vec<IceCandidate> {
        let hub = self.hub.lock();
        hub.pairings
            .get(connection_id)
            .and_then(|pairing| pairing.side(originator))
            .map(|side| side.candidates.clone())
            .unwrap_or_default()
    }

    pub fn is_negotiating(&self, connection_id: &str) -> bool {
        self.hub.lock().pairings.contains_key(connection_id)
    }
}

impl TransportProvider for MemoryProvider {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn negotiate(
        &self,
        request: NegotiationRequest,
        events: Arc<dyn NegotiationEvents>,
    ) -> Arc<dyn Negotiation> {
        let negotiation = Arc::new(MemoryNegotiation {
            hub: Arc::clone(&self.hub),
            connection_id: request.connection_id.clone(),
            originator: request.originator,
            events: Arc::clone(&events),
            torn_down: AtomicBool::new(false),
        });

        if self.hub.lock().failing.contains(&request.connection_id) {
            events.failed(format!(
                "negotiation for {} rejected by memory provider",
                request.connection_id
            ));
            return negotiation;
        }
        if !request.originator && request.remote_sdp.is_none() {
            events.failed("answering side started without an offer".to_string());
            return negotiation;
        }

        let channel = (request.kind == ConnectionKind::Data)
            .then(|| Arc::new(MemoryChannel::new(request.label.clone())));
        {
            let mut hub = self.hub.lock();
            let pairing = hub
                .pairings
                .entry(request.connection_id.clone())
                .or_default();
            *pairing.side_mut(request.originator) = Some(Side {
                events: Arc::clone(&events),
                stream: request.local_stream.clone(),
                channel: channel.clone(),
                candidates: Vec::new(),
            });
        }
        debug!(
            target: "peerlink::provider",
            connection_id = %request.connection_id,
            originator = request.originator,
            "memory negotiation started"
        );

        if let Some(channel) = channel {
            events.channel_ready(channel);
        }
        let (kind, role) = if request.originator {
            (SdpKind::Offer, "offerer")
        } else {
            (SdpKind::Answer, "answerer")
        };
        events.sdp_ready(
            kind,
            format!("v=0 memory-{role} {}", request.connection_id),
        );
        events.candidate_ready(IceCandidate::new(format!(
            "candidate:memory {} {role}",
            request.connection_id
        )));
        negotiation
    }
}

struct MemoryNegotiation {
    hub: Arc<Mutex<Hub>>,
    connection_id: String,
    originator: bool,
    events: Arc<dyn NegotiationEvents>,
    torn_down: AtomicBool,
}

impl MemoryNegotiation {
    fn complete(&self) {
        let sides = {
            let hub = self.hub.lock();
            hub.pairings
                .get(&self.connection_id)
                .and_then(|pairing| Some((pairing.offerer.as_ref()?, pairing.answerer.as_ref()?)))
                .map(|(offerer, answerer)| {
                    (
                        (
                            Arc::clone(&offerer.events),
                            offerer.stream.clone(),
                            offerer.channel.clone(),
                        ),
                        (
                            Arc::clone(&answerer.events),
                            answerer.stream.clone(),
                            answerer.channel.clone(),
                        ),
                    )
                })
        };
        let Some((offerer, answerer)) = sides else {
            self.events
                .failed(format!("no answering side for {}", self.connection_id));
            return;
        };

        let (offer_events, offer_stream, offer_channel) = offerer;
        let (answer_events, answer_stream, answer_channel) = answerer;
        if let (Some(a), Some(b)) = (offer_channel, answer_channel) {
            MemoryChannel::link(&a, &b);
            a.open();
            b.open();
        }
        if let Some(stream) = answer_stream {
            offer_events.remote_stream(stream);
        }
        if let Some(stream) = offer_stream {
            answer_events.remote_stream(stream);
        }
    }
}

impl Negotiation for MemoryNegotiation {
    fn apply_remote_sdp(&self, kind: SdpKind, _sdp: String) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        match (kind, self.originator) {
            (SdpKind::Answer, true) => self.complete(),
            (kind, originator) => warn!(
                target: "peerlink::provider",
                connection_id = %self.connection_id,
                ?kind,
                originator,
                "unexpected remote description"
            ),
        }
    }

    fn apply_remote_candidate(&self, candidate: IceCandidate) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let mut hub = self.hub.lock();
        if let Some(side) = hub
            .pairings
            .get_mut(&self.connection_id)
            .and_then(|pairing| pairing.side_mut(self.originator).as_mut())
        {
            side.candidates.push(candidate);
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = {
            let mut hub = self.hub.lock();
            let Some(pairing) = hub.pairings.get_mut(&self.connection_id) else {
                return;
            };
            let side = pairing.side_mut(self.originator).take();
            if pairing.offerer.is_none() && pairing.answerer.is_none() {
                hub.pairings.remove(&self.connection_id);
            }
            side.and_then(|side| side.channel)
        };
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

/// Loopback data channel with test hooks for backpressure and send failures.
pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    open_notified: bool,
    listener: Option<Arc<dyn ChannelListener>>,
    remote: Weak<MemoryChannel>,
    inbox: VecDeque<Frame>,
    buffered: usize,
    fail_sends: bool,
    sent: Vec<Frame>,
}

impl MemoryChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Join two channels so each one's sends arrive at the other.
    pub fn link(a: &Arc<MemoryChannel>, b: &Arc<MemoryChannel>) {
        a.state.lock().remote = Arc::downgrade(b);
        b.state.lock().remote = Arc::downgrade(a);
    }

    pub fn open(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.closed || state.open {
                return;
            }
            state.open = true;
            let listener = state.listener.clone();
            state.open_notified = listener.is_some();
            listener
        };
        if let Some(listener) = listener {
            listener.opened();
        }
    }

    pub fn set_buffered_amount(&self, amount: usize) {
        self.state.lock().buffered = amount;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Frames written by the local side.
    pub fn sent(&self) -> Vec<Frame> {
        self.state.lock().sent.clone()
    }

    pub fn has_listener(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    fn deliver(&self, frame: Frame) {
        let listener = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state.listener.clone() {
                Some(listener) => listener,
                None => {
                    state.inbox.push_back(frame);
                    return;
                }
            }
        };
        listener.frame(frame);
    }

    fn remote_closed(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.closed();
        }
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        let remote = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(ChannelError::Closed);
            }
            if state.fail_sends {
                return Err(ChannelError::Send("memory channel refused write".into()));
            }
            state.sent.push(frame.clone());
            state.remote.upgrade()
        };
        if let Some(remote) = remote {
            remote.deliver(frame.clone());
        }
        Ok(())
    }

    fn attach(&self, listener: Arc<dyn ChannelListener>) {
        let (backlog, notify_open) = {
            let mut state = self.state.lock();
            state.listener = Some(Arc::clone(&listener));
            let notify_open = state.open && !state.open_notified;
            state.open_notified |= notify_open;
            (std::mem::take(&mut state.inbox), notify_open)
        };
        if notify_open {
            listener.opened();
        }
        for frame in backlog {
            listener.frame(frame);
        }
    }

    fn detach(&self) {
        self.state.lock().listener = None;
    }

    fn close(&self) {
        let (listener, remote) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            (state.listener.take(), state.remote.upgrade())
        };
        if let Some(listener) = listener {
            listener.closed();
        }
        if let Some(remote) = remote {
            remote.remote_closed();
        }
    }
}

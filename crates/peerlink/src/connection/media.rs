use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::negotiator::{NegotiationOwner, Negotiator, OfferFields, SdpTransform};
use super::{ConnectionCore, ConnectionEvent, ConnectionHost, ConnectionKind};
use crate::error::ConnectionError;
use crate::provider::{DataChannel, MediaStream, NegotiationRequest, SdpKind};
use crate::signaling::{MessageType, ServerMessage};

#[derive(Debug, Clone, Default)]
pub struct MediaOptions {
    pub connection_id: Option<String>,
    pub metadata: Option<Value>,
    /// Applied to the local offer.
    pub sdp_transform: Option<SdpTransform>,
}

impl MediaOptions {
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_sdp_transform(mut self, transform: SdpTransform) -> Self {
        self.sdp_transform = Some(transform);
        self
    }
}

/// Options for [`MediaConnection::answer`].
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    /// Applied to the local answer.
    pub sdp_transform: Option<SdpTransform>,
}

impl AnswerOptions {
    pub fn with_sdp_transform(mut self, transform: SdpTransform) -> Self {
        self.sdp_transform = Some(transform);
        self
    }
}

/// Media session with a remote peer. Carries stream handles only; capture
/// and rendering belong to the provider.
#[derive(Clone)]
pub struct MediaConnection {
    inner: Arc<MediaInner>,
}

struct MediaInner {
    core: ConnectionCore,
    remote_sdp: Option<String>,
    sdp_transform: Mutex<Option<SdpTransform>>,
    streams: Mutex<Streams>,
    weak_self: Weak<MediaInner>,
}

#[derive(Default)]
struct Streams {
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
}

impl MediaConnection {
    pub(crate) fn new(
        peer: impl Into<String>,
        local_stream: Option<MediaStream>,
        options: MediaOptions,
        remote_sdp: Option<String>,
        host: &Arc<dyn ConnectionHost>,
    ) -> Self {
        let core = ConnectionCore::new(
            ConnectionKind::Media,
            peer.into(),
            options.connection_id,
            options.metadata,
            Arc::downgrade(host),
        );
        let inner = Arc::new_cyclic(|weak_self| MediaInner {
            core,
            remote_sdp,
            sdp_transform: Mutex::new(options.sdp_transform),
            streams: Mutex::new(Streams {
                local: local_stream,
                remote: None,
            }),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Begin the handshake as originator. Answering calls start in `answer`.
    pub(crate) fn start(&self) {
        if self.inner.remote_sdp.is_none() {
            self.inner.start_negotiation();
        }
    }

    pub(crate) fn core(&self) -> &ConnectionCore {
        &self.inner.core
    }

    pub fn connection_id(&self) -> &str {
        self.inner.core.connection_id()
    }

    pub fn peer(&self) -> &str {
        self.inner.core.peer()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.inner.core.metadata()
    }

    pub fn is_open(&self) -> bool {
        self.inner.core.is_open()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.streams.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.streams.lock().remote.clone()
    }

    /// Connection events; available once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.core.take_events()
    }

    /// Accept an incoming call with the local stream to send back.
    pub fn answer(&self, stream: MediaStream, options: AnswerOptions) {
        let inner = &self.inner;
        if inner.core.is_closed() {
            warn!(
                target: "peerlink::connection",
                connection_id = %inner.core.connection_id(),
                "cannot answer a closed call"
            );
            return;
        }
        {
            let mut streams = inner.streams.lock();
            if streams.local.is_some() {
                warn!(
                    target: "peerlink::connection",
                    connection_id = %inner.core.connection_id(),
                    "local stream already attached; call answered twice?"
                );
                return;
            }
            streams.local = Some(stream);
        }
        if options.sdp_transform.is_some() {
            *inner.sdp_transform.lock() = options.sdp_transform;
        }
        inner.start_negotiation();

        let lost = inner
            .core
            .host()
            .map(|host| host.take_lost_messages(inner.core.connection_id()))
            .unwrap_or_default();
        for message in lost {
            inner.handle_message(message);
        }
        inner.mark_open();
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn handle_message(&self, message: ServerMessage) {
        self.inner.handle_message(message);
    }

    pub fn same_connection(&self, other: &MediaConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection")
            .field("connection_id", &self.connection_id())
            .field("peer", &self.peer())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for MediaConnection {
    fn eq(&self, other: &Self) -> bool {
        self.same_connection(other)
    }
}

impl MediaInner {
    fn start_negotiation(&self) {
        let Some(host) = self.core.host() else {
            return;
        };
        let request = NegotiationRequest {
            connection_id: self.core.connection_id().to_string(),
            peer: self.core.peer().to_string(),
            kind: ConnectionKind::Media,
            originator: self.remote_sdp.is_none(),
            remote_sdp: self.remote_sdp.clone(),
            label: self.core.connection_id().to_string(),
            reliable: false,
            local_stream: self.streams.lock().local.clone(),
            config: host.transport_config(),
        };
        let fields = OfferFields {
            metadata: self.core.metadata().cloned(),
            sdp_transform: self.sdp_transform.lock().clone(),
            ..Default::default()
        };
        let owner: Weak<dyn NegotiationOwner> = self.weak_self.clone();
        let negotiator = Negotiator::start(owner, host.as_ref(), request, fields);
        self.core.install_negotiator(negotiator);
    }

    fn handle_message(&self, message: ServerMessage) {
        let Some(negotiator) = self.core.negotiator() else {
            warn!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                "signaling message for call without a handshake"
            );
            return;
        };
        let payload = message.payload.unwrap_or_default();
        match message.kind {
            MessageType::Answer => {
                let Some(sdp) = payload.sdp else {
                    warn!(target: "peerlink::connection", "answer without sdp");
                    return;
                };
                negotiator.handle_sdp(SdpKind::Answer, sdp.sdp);
                self.mark_open();
            }
            MessageType::Candidate => match payload.candidate {
                Some(candidate) => negotiator.handle_candidate(candidate),
                None => warn!(target: "peerlink::connection", "candidate message without candidate"),
            },
            other => warn!(
                target: "peerlink::connection",
                message_type = ?other,
                peer = %self.core.peer(),
                "unrecognized message type"
            ),
        }
    }

    fn mark_open(&self) {
        if self.core.is_closed() {
            return;
        }
        if !self.core.set_open(true) {
            debug!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                "media connection open"
            );
            self.core.emit(ConnectionEvent::Open);
        }
    }

    fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        {
            let mut streams = self.streams.lock();
            streams.local = None;
            streams.remote = None;
        }
        self.core.teardown_negotiator();
        self.core.deregister();
        debug!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            peer = %self.core.peer(),
            "media connection closed"
        );
        if self.core.set_open(false) {
            self.core.emit(ConnectionEvent::Close);
        }
    }
}

impl NegotiationOwner for MediaInner {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn channel_ready(&self, channel: Arc<dyn DataChannel>) {
        warn!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            label = %channel.label(),
            "media connection ignoring data channel"
        );
        channel.close();
    }

    fn remote_stream(&self, stream: MediaStream) {
        if self.core.is_closed() {
            return;
        }
        debug!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            stream_id = %stream.id(),
            "remote stream received"
        );
        self.streams.lock().remote = Some(stream.clone());
        self.core.emit(ConnectionEvent::Stream(stream));
    }

    fn negotiation_failed(&self, reason: String) {
        warn!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            %reason,
            "negotiation failed"
        );
        self.core
            .emit(ConnectionEvent::Error(ConnectionError::Negotiation(reason)));
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{RecordingHost, drain};
    use crate::provider::{IceCandidate, MemoryProvider};
    use crate::signaling::MessagePayload;

    fn host_arc(host: &Arc<RecordingHost>) -> Arc<dyn ConnectionHost> {
        host.clone()
    }

    fn offer_of(host: &RecordingHost) -> ServerMessage {
        host.take_signals()
            .into_iter()
            .find(|m| m.kind == MessageType::Offer)
            .expect("offer signal")
    }

    #[test]
    fn call_answer_exchanges_streams() {
        let provider = MemoryProvider::new();
        let alice = RecordingHost::new(provider.clone());
        let bob = RecordingHost::new(provider.clone());
        let camera = MediaStream::empty("alice-cam");
        let call = MediaConnection::new(
            "bob",
            Some(camera.clone()),
            MediaOptions::default().with_metadata(serde_json::json!({"room": 7})),
            None,
            &host_arc(&alice),
        );
        call.start();
        assert!(call.connection_id().starts_with("mc_"));
        let mut call_events = call.events().unwrap();

        let offer = offer_of(&alice);
        let payload = offer.payload.unwrap();
        assert_eq!(payload.connection_type.as_deref(), Some("media"));
        assert_eq!(payload.metadata, Some(serde_json::json!({"room": 7})));
        assert!(payload.label.is_none());

        let incoming = MediaConnection::new(
            "alice",
            None,
            MediaOptions {
                connection_id: payload.connection_id.clone(),
                metadata: payload.metadata.clone(),
                ..Default::default()
            },
            payload.sdp.map(|sdp| sdp.sdp),
            &host_arc(&bob),
        );
        incoming.start();
        assert!(bob.take_signals().is_empty());
        let mut incoming_events = incoming.events().unwrap();

        let speaker = MediaStream::empty("bob-cam");
        incoming.answer(speaker.clone(), AnswerOptions::default());
        assert!(incoming.is_open());
        let answer = bob
            .take_signals()
            .into_iter()
            .find(|m| m.kind == MessageType::Answer)
            .expect("answer signal");
        call.handle_message(answer);

        assert!(call.is_open());
        assert_eq!(call.remote_stream(), Some(speaker.clone()));
        assert_eq!(incoming.remote_stream(), Some(camera.clone()));
        assert_eq!(
            drain(&mut call_events),
            vec![ConnectionEvent::Stream(speaker), ConnectionEvent::Open]
        );
        assert_eq!(
            drain(&mut incoming_events),
            vec![ConnectionEvent::Open, ConnectionEvent::Stream(camera)]
        );
    }

    #[test]
    fn answering_twice_is_ignored() {
        let provider = MemoryProvider::new();
        let alice = RecordingHost::new(provider.clone());
        let bob = RecordingHost::new(provider.clone());
        let call = MediaConnection::new(
            "bob",
            Some(MediaStream::empty("local")),
            MediaOptions::default(),
            None,
            &host_arc(&alice),
        );
        call.start();
        let payload = offer_of(&alice).payload.unwrap();
        let incoming = MediaConnection::new(
            "alice",
            None,
            MediaOptions {
                connection_id: payload.connection_id,
                metadata: None,
                ..Default::default()
            },
            payload.sdp.map(|sdp| sdp.sdp),
            &host_arc(&bob),
        );
        let mut events = incoming.events().unwrap();
        let first = MediaStream::empty("first");
        incoming.answer(first.clone(), AnswerOptions::default());
        incoming.answer(MediaStream::empty("second"), AnswerOptions::default());

        assert_eq!(incoming.local_stream(), Some(first));
        let answers = bob
            .take_signals()
            .into_iter()
            .filter(|m| m.kind == MessageType::Answer)
            .count();
        assert_eq!(answers, 1);
        assert_eq!(drain(&mut events), vec![ConnectionEvent::Open]);
    }

    #[test]
    fn answer_drains_lost_candidates_in_order() {
        let provider = MemoryProvider::new();
        let alice = RecordingHost::new(provider.clone());
        let bob = RecordingHost::new(provider.clone());
        let call = MediaConnection::new(
            "bob",
            Some(MediaStream::empty("local")),
            MediaOptions::default(),
            None,
            &host_arc(&alice),
        );
        call.start();
        let payload = offer_of(&alice).payload.unwrap();
        let id = payload.connection_id.clone().unwrap();
        for n in 0..3 {
            bob.lost.lock().store(
                &id,
                ServerMessage::new(MessageType::Candidate)
                    .with_src("alice")
                    .with_payload(MessagePayload {
                        connection_id: Some(id.clone()),
                        candidate: Some(IceCandidate::new(format!("candidate:{n}"))),
                        ..Default::default()
                    }),
            );
        }
        let incoming = MediaConnection::new(
            "alice",
            None,
            MediaOptions {
                connection_id: Some(id.clone()),
                metadata: None,
                ..Default::default()
            },
            payload.sdp.map(|sdp| sdp.sdp),
            &host_arc(&bob),
        );
        incoming.answer(MediaStream::empty("local"), AnswerOptions::default());

        let applied: Vec<String> = provider
            .applied_candidates(&id, false)
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, ["candidate:0", "candidate:1", "candidate:2"]);
        assert!(bob.lost.lock().is_empty());
    }

    #[test]
    fn close_clears_streams_and_emits_once() {
        let provider = MemoryProvider::new();
        let alice = RecordingHost::new(provider.clone());
        let call = MediaConnection::new(
            "bob",
            Some(MediaStream::empty("local")),
            MediaOptions::default(),
            None,
            &host_arc(&alice),
        );
        call.start();
        let mut events = call.events().unwrap();
        // as if the ANSWER had arrived
        call.inner.mark_open();
        call.close();
        call.close();
        assert!(call.local_stream().is_none());
        assert_eq!(
            drain(&mut events),
            vec![ConnectionEvent::Open, ConnectionEvent::Close]
        );
        assert_eq!(alice.removed.lock().len(), 1);
        assert!(!provider.is_negotiating(call.connection_id()));
    }

    #[test]
    fn sdp_transforms_rewrite_local_descriptions() {
        let provider = MemoryProvider::new();
        let alice = RecordingHost::new(provider.clone());
        let bob = RecordingHost::new(provider.clone());
        let call = MediaConnection::new(
            "bob",
            Some(MediaStream::empty("local")),
            MediaOptions::default()
                .with_sdp_transform(SdpTransform::new(|sdp| format!("{sdp}\r\na=offer-tag"))),
            None,
            &host_arc(&alice),
        );
        call.start();
        let payload = offer_of(&alice).payload.unwrap();
        let offer_sdp = payload.sdp.clone().unwrap().sdp;
        assert!(offer_sdp.ends_with("a=offer-tag"));

        let incoming = MediaConnection::new(
            "alice",
            None,
            MediaOptions {
                connection_id: payload.connection_id,
                ..Default::default()
            },
            Some(offer_sdp),
            &host_arc(&bob),
        );
        incoming.answer(
            MediaStream::empty("remote"),
            AnswerOptions::default()
                .with_sdp_transform(SdpTransform::new(|sdp| sdp.replace("memory", "rewritten"))),
        );
        let answer = bob
            .take_signals()
            .into_iter()
            .find(|m| m.kind == MessageType::Answer)
            .and_then(|m| m.payload)
            .and_then(|p| p.sdp)
            .expect("answer sdp");
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(answer.sdp.contains("rewritten-answerer"));
        assert!(!answer.sdp.contains("offer-tag"));
    }
}

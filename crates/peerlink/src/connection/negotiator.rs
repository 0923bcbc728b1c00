//! Handshake sequencing between a connection, its provider negotiation and
//! the signaling server.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, trace};

use super::{ConnectionCore, ConnectionHost, ConnectionKind};
use crate::provider::{
    DataChannel, IceCandidate, MediaStream, Negotiation, NegotiationEvents, NegotiationRequest,
    SdpKind, SessionDescription,
};
use crate::signaling::{MessagePayload, MessageType, ServerMessage};

pub(crate) const BROWSER: &str = concat!("peerlink/", env!("CARGO_PKG_VERSION"));

/// Connection-side receiver of negotiation progress.
pub(crate) trait NegotiationOwner: Send + Sync {
    fn core(&self) -> &ConnectionCore;
    fn channel_ready(&self, channel: Arc<dyn DataChannel>);
    fn remote_stream(&self, stream: MediaStream);
    fn negotiation_failed(&self, reason: String);
}

/// Rewrites a locally generated session description before it is signaled.
#[derive(Clone)]
pub struct SdpTransform(Arc<dyn Fn(String) -> String + Send + Sync>);

impl SdpTransform {
    pub fn new(transform: impl Fn(String) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(transform))
    }

    pub fn apply(&self, sdp: String) -> String {
        (self.0)(sdp)
    }
}

impl fmt::Debug for SdpTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SdpTransform")
    }
}

/// Extra fields advertised in the `OFFER` payload.
#[derive(Debug, Clone, Default)]
pub(crate) struct OfferFields {
    pub label: Option<String>,
    pub reliable: Option<bool>,
    pub serialization: Option<String>,
    pub metadata: Option<Value>,
    pub sdp_transform: Option<SdpTransform>,
}

pub(crate) struct Negotiator {
    negotiation: Arc<dyn Negotiation>,
    active: Arc<AtomicBool>,
}

impl Negotiator {
    pub(crate) fn start(
        owner: Weak<dyn NegotiationOwner>,
        host: &dyn ConnectionHost,
        request: NegotiationRequest,
        fields: OfferFields,
    ) -> Arc<Negotiator> {
        let active = Arc::new(AtomicBool::new(true));
        debug!(
            target: "peerlink::connection",
            connection_id = %request.connection_id,
            peer = %request.peer,
            originator = request.originator,
            "starting negotiation"
        );
        let bridge = Arc::new(EventBridge {
            owner,
            active: Arc::clone(&active),
            connection_id: request.connection_id.clone(),
            peer: request.peer.clone(),
            kind: request.kind,
            fields,
        });
        let negotiation = host.provider().negotiate(request, bridge);
        Arc::new(Negotiator {
            negotiation,
            active,
        })
    }

    pub(crate) fn handle_sdp(&self, kind: SdpKind, sdp: String) {
        if self.active.load(Ordering::SeqCst) {
            self.negotiation.apply_remote_sdp(kind, sdp);
        }
    }

    pub(crate) fn handle_candidate(&self, candidate: IceCandidate) {
        if self.active.load(Ordering::SeqCst) {
            self.negotiation.apply_remote_candidate(candidate);
        }
    }

    /// Idempotent; provider events arriving afterwards are ignored.
    pub(crate) fn cleanup(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.negotiation.teardown();
        }
    }
}

struct EventBridge {
    owner: Weak<dyn NegotiationOwner>,
    active: Arc<AtomicBool>,
    connection_id: String,
    peer: String,
    kind: ConnectionKind,
    fields: OfferFields,
}

impl EventBridge {
    fn owner(&self) -> Option<Arc<dyn NegotiationOwner>> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        self.owner.upgrade()
    }

    fn payload(&self) -> MessagePayload {
        MessagePayload {
            connection_id: Some(self.connection_id.clone()),
            connection_type: Some(self.kind.as_str().to_string()),
            ..Default::default()
        }
    }
}

impl NegotiationEvents for EventBridge {
    fn sdp_ready(&self, kind: SdpKind, sdp: String) {
        let Some(owner) = self.owner() else {
            return;
        };
        let sdp = match &self.fields.sdp_transform {
            Some(transform) => transform.apply(sdp),
            None => sdp,
        };
        let mut payload = self.payload();
        payload.sdp = Some(SessionDescription { kind, sdp });
        payload.browser = Some(BROWSER.to_string());
        let message_type = match kind {
            SdpKind::Offer => {
                payload.label = self.fields.label.clone();
                payload.reliable = self.fields.reliable;
                payload.serialization = self.fields.serialization.clone();
                payload.metadata = self.fields.metadata.clone();
                MessageType::Offer
            }
            SdpKind::Answer => MessageType::Answer,
        };
        trace!(
            target: "peerlink::connection",
            connection_id = %self.connection_id,
            ?message_type,
            "local description ready"
        );
        owner.core().send_signal(
            ServerMessage::new(message_type)
                .with_dst(self.peer.clone())
                .with_payload(payload),
        );
    }

    fn candidate_ready(&self, candidate: IceCandidate) {
        let Some(owner) = self.owner() else {
            return;
        };
        let mut payload = self.payload();
        payload.candidate = Some(candidate);
        owner.core().send_signal(
            ServerMessage::new(MessageType::Candidate)
                .with_dst(self.peer.clone())
                .with_payload(payload),
        );
    }

    fn channel_ready(&self, channel: Arc<dyn DataChannel>) {
        if let Some(owner) = self.owner() {
            owner.channel_ready(channel);
        }
    }

    fn remote_stream(&self, stream: MediaStream) {
        if let Some(owner) = self.owner() {
            owner.remote_stream(stream);
        }
    }

    fn failed(&self, reason: String) {
        if let Some(owner) = self.owner() {
            owner.negotiation_failed(reason);
        }
    }
}

//! Boundary to the engine that negotiates and carries the direct transport.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::connection::ConnectionKind;
use crate::error::ChannelError;

pub mod memory;

pub use memory::{MemoryChannel, MemoryProvider};

/// One message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as carried in `OFFER`/`ANSWER` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Opaque media stream handle. The provider decides what `inner` holds.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            inner,
        }
    }

    /// A stream with no provider payload.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Arc::new(()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id).finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub data: bool,
    pub media: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            data: true,
            media: true,
        }
    }

    pub fn none() -> Self {
        Self {
            data: false,
            media: false,
        }
    }
}

/// Everything a provider needs to begin one connection's handshake.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub connection_id: String,
    pub peer: String,
    pub kind: ConnectionKind,
    pub originator: bool,
    /// Offer SDP when answering.
    pub remote_sdp: Option<String>,
    pub label: String,
    pub reliable: bool,
    pub local_stream: Option<MediaStream>,
    pub config: TransportConfig,
}

pub trait TransportProvider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Begin a handshake. Implementations report progress through `events`,
    /// possibly before this call returns.
    fn negotiate(
        &self,
        request: NegotiationRequest,
        events: Arc<dyn NegotiationEvents>,
    ) -> Arc<dyn Negotiation>;
}

/// A running handshake owned by one connection.
pub trait Negotiation: Send + Sync {
    fn apply_remote_sdp(&self, kind: SdpKind, sdp: String);
    fn apply_remote_candidate(&self, candidate: IceCandidate);
    fn teardown(&self);
}

pub trait NegotiationEvents: Send + Sync {
    fn sdp_ready(&self, kind: SdpKind, sdp: String);
    fn candidate_ready(&self, candidate: IceCandidate);
    fn channel_ready(&self, channel: Arc<dyn DataChannel>);
    fn remote_stream(&self, stream: MediaStream);
    fn failed(&self, reason: String);
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    fn buffered_amount(&self) -> usize;
    fn send(&self, frame: &Frame) -> Result<(), ChannelError>;
    /// Install the listener; inbound frames that arrived earlier are replayed.
    fn attach(&self, listener: Arc<dyn ChannelListener>);
    fn detach(&self);
    fn close(&self);
}

pub trait ChannelListener: Send + Sync {
    fn opened(&self);
    fn frame(&self, frame: Frame);
    fn closed(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(
            value,
            json!({
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
        let parsed: IceCandidate = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn stream_handles_downcast_to_provider_payload() {
        let stream = MediaStream::new("cam", Arc::new(42u32));
        assert_eq!(stream.downcast::<u32>().as_deref(), Some(&42));
        assert!(stream.downcast::<String>().is_none());
        assert_eq!(stream.clone(), stream);
        assert_ne!(MediaStream::empty("cam"), stream);
    }
}

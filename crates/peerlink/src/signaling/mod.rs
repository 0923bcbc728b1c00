//! Signaling wire messages and the persistent link to the signaling server.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::SignalingError;
use crate::provider::{IceCandidate, SessionDescription};

pub mod memory;
pub mod socket;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryLinkHandle};
pub use socket::{SignalingSocket, SocketEvent, SocketListener};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    #[serde(rename = "INVALID-KEY")]
    InvalidKey,
    #[serde(rename = "LEAVE")]
    Leave,
    #[serde(rename = "EXPIRE")]
    Expire,
    #[serde(rename = "OFFER")]
    Offer,
    #[serde(rename = "ANSWER")]
    Answer,
    #[serde(rename = "CANDIDATE")]
    Candidate,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// `{type, src?, dst?, payload?}` exchanged with the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
}

impl ServerMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            src: None,
            dst: None,
            payload: None,
        }
    }

    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_payload(mut self, payload: MessagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.payload.as_ref()?.connection_id.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// `"data"` or `"media"`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Opens links to a signaling endpoint.
pub trait SignalingConnector: Send + Sync {
    /// Must return before invoking any `listener` callback.
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn LinkListener>,
    ) -> Result<Arc<dyn SignalingLink>, SignalingError>;
}

/// One live (or pending) connection to the signaling endpoint.
pub trait SignalingLink: Send + Sync {
    fn is_writable(&self) -> bool;
    fn send_text(&self, text: String) -> Result<(), SignalingError>;
    fn close(&self);
}

pub trait LinkListener: Send + Sync {
    fn opened(&self);
    fn message(&self, text: String);
    fn closed(&self);
}

/// `{ws|wss}://host:port{path}peerjs?key=K`; `id` and `token` are appended on start.
pub fn socket_base_url(secure: bool, host: &str, port: u16, path: &str, key: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{host}:{port}{path}peerjs?key={key}")
}

pub(crate) fn socket_url(base: &str, id: &str, token: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base).map_err(|err| SignalingError::Url(format!("{base}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("id", id)
        .append_pair("token", token);
    Ok(url)
}

use std::fmt;

use thiserror::Error;

/// Category of a peer-level failure, carried on every `PeerEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The transport provider supports neither data nor media.
    Incompatible,
    InvalidId,
    UnavailableId,
    InvalidKey,
    /// Lost the signaling link; live connections may survive.
    Network,
    SocketError,
    SocketClosed,
    ServerError,
    PeerUnavailable,
    /// Operation attempted after `disconnect()` or `destroy()`.
    Disconnected,
    /// `call` without a local stream.
    InvalidStream,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Incompatible => "incompatible",
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::UnavailableId => "unavailable-id",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::Network => "network",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::SocketClosed => "socket-closed",
            ErrorKind::ServerError => "server-error",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::InvalidStream => "invalid-stream",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PeerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failures reported on a single connection's event stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("connection is not open; wait for the open event before sending")]
    NotOpen,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("data channel closed")]
    Closed,
    #[error("data channel send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("value cannot be sent with {0} serialization")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    Url(String),
    #[error("signaling link closed")]
    ChannelClosed,
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
    #[error("identity request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity request returned status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

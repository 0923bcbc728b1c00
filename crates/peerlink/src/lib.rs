//! peerlink: a peer-to-peer client that exchanges handshakes through a
//! PeerJS-compatible signaling server and multiplexes data and media
//! connections over a pluggable transport provider.
//!
//! - [`Peer`] owns the signaling link, the identity and the connection registry
//! - [`DataConnection`] carries binary, JSON or raw payloads with chunking and backpressure
//! - [`MediaConnection`] carries opaque stream handles
//! - [`provider`] is the seam to the transport engine; [`MemoryProvider`] pairs peers in-process

pub mod api;
pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod logging;
pub mod lost;
pub mod peer;
pub mod provider;
pub mod signaling;

pub use codec::{BincodeCodec, Codec, DataValue};
pub use config::{IceServer, PeerOptions, TransportConfig};
pub use connection::{
    AnswerOptions, Connection, ConnectionEvent, ConnectionKind, DataConnection,
    DataConnectionOptions, MediaConnection, MediaOptions, SdpTransform, Serialization,
};
pub use error::{
    ChannelError, CodecError, ConfigError, ConnectionError, ErrorKind, PeerError, SignalingError,
};
pub use logging::{LogConfig, LogLevel};
pub use peer::{Peer, PeerBuilder, PeerEvent, PeerState};
pub use provider::{
    Capabilities, ChannelListener, DataChannel, Frame, IceCandidate, MediaStream, MemoryProvider,
    Negotiation, NegotiationEvents, NegotiationRequest, SdpKind, SessionDescription,
    TransportProvider,
};
pub use signaling::{MemoryConnector, ServerMessage, WebSocketConnector};

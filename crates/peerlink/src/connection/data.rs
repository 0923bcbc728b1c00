use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::negotiator::{NegotiationOwner, Negotiator, OfferFields, SdpTransform};
use super::{ConnectionCore, ConnectionEvent, ConnectionHost, ConnectionKind};
use crate::buffer::{FrameSink, Flush, RETRY_DELAY, SendBuffer};
use crate::chunk::{CHUNKED_MTU, Chunk, ChunkReassembler, split};
use crate::codec::{Codec, DataValue};
use crate::error::{ChannelError, CodecError, ConnectionError};
use crate::provider::{
    ChannelListener, DataChannel, Frame, MediaStream, NegotiationRequest, SdpKind,
};
use crate::signaling::{MessagePayload, MessageType, ServerMessage};

/// How application values are framed on the data channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Serialization {
    /// Codec-packed binary frames, chunked above the MTU.
    #[default]
    Binary,
    BinaryUtf8,
    /// JSON text frames.
    Json,
    /// Text and bytes passed through untouched.
    Raw,
}

impl Serialization {
    pub fn as_str(self) -> &'static str {
        match self {
            Serialization::Binary => "binary",
            Serialization::BinaryUtf8 => "binary-utf8",
            Serialization::Json => "json",
            Serialization::Raw => "raw",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "binary" => Some(Serialization::Binary),
            "binary-utf8" => Some(Serialization::BinaryUtf8),
            "json" => Some(Serialization::Json),
            "raw" | "none" => Some(Serialization::Raw),
            _ => None,
        }
    }

    fn is_binary(self) -> bool {
        matches!(self, Serialization::Binary | Serialization::BinaryUtf8)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataConnectionOptions {
    pub connection_id: Option<String>,
    /// Defaults to the connection id.
    pub label: Option<String>,
    pub serialization: Serialization,
    pub reliable: bool,
    pub metadata: Option<Value>,
    /// Applied to the local offer or answer.
    pub sdp_transform: Option<SdpTransform>,
}

impl DataConnectionOptions {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn with_sdp_transform(mut self, transform: SdpTransform) -> Self {
        self.sdp_transform = Some(transform);
        self
    }

    pub(crate) fn from_offer(payload: &MessagePayload) -> Self {
        Self {
            connection_id: payload.connection_id.clone(),
            label: payload.label.clone(),
            serialization: payload
                .serialization
                .as_deref()
                .and_then(Serialization::parse)
                .unwrap_or_default(),
            reliable: payload.reliable.unwrap_or(false),
            metadata: payload.metadata.clone(),
            sdp_transform: None,
        }
    }
}

/// Binary or JSON payload channel to one remote peer.
#[derive(Clone)]
pub struct DataConnection {
    inner: Arc<DataInner>,
}

struct DataInner {
    core: ConnectionCore,
    label: String,
    serialization: Serialization,
    reliable: bool,
    sdp_transform: Option<SdpTransform>,
    codec: Arc<dyn Codec>,
    /// Offer SDP when this side answers.
    remote_sdp: Option<String>,
    outbound: Mutex<Outbound>,
    reassembler: Mutex<ChunkReassembler>,
    weak_self: Weak<DataInner>,
}

struct Outbound {
    channel: Option<Arc<dyn DataChannel>>,
    buffer: SendBuffer,
    retry: Option<JoinHandle<()>>,
}

struct ChannelSink(Option<Arc<dyn DataChannel>>);

impl FrameSink for ChannelSink {
    fn is_open(&self) -> bool {
        self.0.as_ref().is_some_and(|channel| channel.is_open())
    }

    fn buffered_amount(&self) -> usize {
        self.0.as_ref().map_or(0, |channel| channel.buffered_amount())
    }

    fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        match &self.0 {
            Some(channel) => channel.send(frame),
            None => Err(ChannelError::Closed),
        }
    }
}

impl DataConnection {
    pub(crate) fn new(
        peer: impl Into<String>,
        options: DataConnectionOptions,
        remote_sdp: Option<String>,
        host: &Arc<dyn ConnectionHost>,
    ) -> Self {
        let core = ConnectionCore::new(
            ConnectionKind::Data,
            peer.into(),
            options.connection_id,
            options.metadata,
            Arc::downgrade(host),
        );
        let label = options
            .label
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| core.connection_id().to_string());
        let inner = Arc::new_cyclic(|weak_self| DataInner {
            core,
            label,
            serialization: options.serialization,
            reliable: options.reliable,
            sdp_transform: options.sdp_transform,
            codec: host.codec(),
            remote_sdp,
            outbound: Mutex::new(Outbound {
                channel: None,
                buffer: SendBuffer::default(),
                retry: None,
            }),
            reassembler: Mutex::new(ChunkReassembler::default()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Begin the handshake: as originator, or answering the stored offer.
    pub(crate) fn start(&self) {
        let inner = &self.inner;
        let Some(host) = inner.core.host() else {
            return;
        };
        let request = NegotiationRequest {
            connection_id: inner.core.connection_id().to_string(),
            peer: inner.core.peer().to_string(),
            kind: ConnectionKind::Data,
            originator: inner.remote_sdp.is_none(),
            remote_sdp: inner.remote_sdp.clone(),
            label: inner.label.clone(),
            reliable: inner.reliable,
            local_stream: None,
            config: host.transport_config(),
        };
        let fields = OfferFields {
            label: Some(inner.label.clone()),
            reliable: Some(inner.reliable),
            serialization: Some(inner.serialization.as_str().to_string()),
            metadata: inner.core.metadata().cloned(),
            sdp_transform: inner.sdp_transform.clone(),
        };
        let owner: Weak<DataInner> = inner.weak_self.clone();
        let negotiator = Negotiator::start(owner, host.as_ref(), request, fields);
        inner.core.install_negotiator(negotiator);
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

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn serialization(&self) -> Serialization {
        self.inner.serialization
    }

    pub fn reliable(&self) -> bool {
        self.inner.reliable
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.inner.core.metadata()
    }

    pub fn is_open(&self) -> bool {
        self.inner.core.is_open()
    }

    /// Frames waiting for the channel to drain.
    pub fn buffer_size(&self) -> usize {
        self.inner.outbound.lock().buffer.len()
    }

    /// Connection events; available once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.core.take_events()
    }

    pub fn send(&self, value: impl Into<DataValue>) {
        self.inner.send(value.into(), false);
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn handle_message(&self, message: ServerMessage) {
        self.inner.handle_message(message);
    }

    pub fn same_connection(&self, other: &DataConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("connection_id", &self.connection_id())
            .field("peer", &self.peer())
            .field("serialization", &self.inner.serialization)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for DataConnection {
    fn eq(&self, other: &Self) -> bool {
        self.same_connection(other)
    }
}

impl DataInner {
    fn handle_message(&self, message: ServerMessage) {
        let Some(negotiator) = self.core.negotiator() else {
            warn!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                "signaling message for connection without a handshake"
            );
            return;
        };
        let payload = message.payload.unwrap_or_default();
        match message.kind {
            MessageType::Answer => match payload.sdp {
                Some(sdp) => negotiator.handle_sdp(SdpKind::Answer, sdp.sdp),
                None => warn!(target: "peerlink::connection", "answer without sdp"),
            },
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

    fn send(&self, value: DataValue, chunked: bool) {
        if !self.core.is_open() {
            self.core.emit(ConnectionEvent::Error(ConnectionError::NotOpen));
            return;
        }
        let frame = match self.encode(value, chunked) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                self.core.emit(ConnectionEvent::Error(err.into()));
                return;
            }
        };
        self.buffered_send(frame);
    }

    /// `None` when the value went out as chunks.
    fn encode(&self, value: DataValue, chunked: bool) -> Result<Option<Frame>, CodecError> {
        match self.serialization {
            Serialization::Json => serde_json::to_string(&value.to_json())
                .map(|text| Some(Frame::Text(text)))
                .map_err(|err| CodecError::Encode(err.to_string())),
            Serialization::Binary | Serialization::BinaryUtf8 => {
                let packed = self.codec.pack(&value)?;
                if !chunked && packed.len() > CHUNKED_MTU {
                    self.send_chunks(&packed);
                    return Ok(None);
                }
                Ok(Some(Frame::Binary(packed)))
            }
            Serialization::Raw => match value {
                DataValue::Text(text) => Ok(Some(Frame::Text(text))),
                DataValue::Bytes(bytes) => Ok(Some(Frame::Binary(bytes))),
                _ => Err(CodecError::Unsupported("raw")),
            },
        }
    }

    fn send_chunks(&self, packed: &Bytes) {
        let chunks = split(packed, CHUNKED_MTU);
        debug!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            chunks = chunks.len(),
            len = packed.len(),
            "sending chunked payload"
        );
        for chunk in chunks {
            self.send(chunk.into_value(), true);
        }
    }

    fn buffered_send(&self, frame: Frame) {
        let flush = {
            let mut outbound = self.outbound.lock();
            let sink = ChannelSink(outbound.channel.clone());
            outbound.buffer.buffered_send(frame, &sink)
        };
        self.apply(flush);
    }

    fn apply(&self, flush: Flush) {
        if let Some(err) = flush.fatal {
            error!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                error = %err,
                "data channel send failed; closing connection"
            );
            self.close();
            return;
        }
        if flush.schedule_retry {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "peerlink::connection", "no tokio runtime; send buffer retry skipped");
            return;
        };
        let mut outbound = self.outbound.lock();
        if outbound.retry.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let connection = self.weak_self.clone();
        outbound.retry = Some(runtime.spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            if let Some(connection) = connection.upgrade() {
                connection.retry_buffer();
            }
        }));
    }

    fn retry_buffer(&self) {
        if !self.core.is_open() {
            return;
        }
        let flush = {
            let mut outbound = self.outbound.lock();
            outbound.retry = None;
            let sink = ChannelSink(outbound.channel.clone());
            outbound.buffer.resume(&sink)
        };
        trace!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            remaining = self.outbound.lock().buffer.len(),
            "send buffer retried"
        );
        self.apply(flush);
    }

    fn handle_frame(&self, frame: Frame) {
        match self.decode(frame) {
            Ok(value) => self.deliver(value),
            Err(err) => {
                warn!(
                    target: "peerlink::connection",
                    connection_id = %self.core.connection_id(),
                    error = %err,
                    "failed to decode inbound frame"
                );
                self.core.emit(ConnectionEvent::Error(err.into()));
            }
        }
    }

    fn decode(&self, frame: Frame) -> Result<DataValue, CodecError> {
        match (self.serialization, frame) {
            (serialization, Frame::Binary(bytes)) if serialization.is_binary() => {
                self.codec.unpack(&bytes)
            }
            (serialization, Frame::Text(text)) if serialization.is_binary() => {
                self.codec.unpack(&binary_string_to_bytes(&text)?)
            }
            (Serialization::Json, Frame::Text(text)) => serde_json::from_str::<Value>(&text)
                .map(DataValue::from)
                .map_err(|err| CodecError::Decode(err.to_string())),
            (Serialization::Json, Frame::Binary(bytes)) => serde_json::from_slice::<Value>(&bytes)
                .map(DataValue::from)
                .map_err(|err| CodecError::Decode(err.to_string())),
            (_, Frame::Text(text)) => Ok(DataValue::Text(text)),
            (_, Frame::Binary(bytes)) => Ok(DataValue::Bytes(bytes)),
        }
    }

    fn deliver(&self, value: DataValue) {
        if !Chunk::is_chunk(&value) {
            self.core.emit(ConnectionEvent::Data(value));
            return;
        }
        let Some(chunk) = Chunk::from_value(&value) else {
            warn!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                "dropping malformed chunk"
            );
            return;
        };
        let complete = self.reassembler.lock().accept(chunk);
        if let Some(bytes) = complete {
            trace!(
                target: "peerlink::connection",
                connection_id = %self.core.connection_id(),
                len = bytes.len(),
                "chunked payload reassembled"
            );
            self.handle_frame(Frame::Binary(bytes));
        }
    }

    fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        let (channel, retry) = {
            let mut outbound = self.outbound.lock();
            outbound.buffer.clear();
            (outbound.channel.take(), outbound.retry.take())
        };
        self.reassembler.lock().clear();
        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(channel) = &channel {
            channel.detach();
        }
        self.core.teardown_negotiator();
        self.core.deregister();
        if let Some(channel) = channel {
            channel.close();
        }
        debug!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            peer = %self.core.peer(),
            "data connection closed"
        );
        if self.core.set_open(false) {
            self.core.emit(ConnectionEvent::Close);
        }
    }

    fn channel_opened(&self) {
        if self.core.is_closed() {
            return;
        }
        debug!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            "data channel open"
        );
        if !self.core.set_open(true) {
            self.core.emit(ConnectionEvent::Open);
        }
    }
}

impl NegotiationOwner for DataInner {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn channel_ready(&self, channel: Arc<dyn DataChannel>) {
        if self.core.is_closed() {
            channel.close();
            return;
        }
        self.outbound.lock().channel = Some(Arc::clone(&channel));
        channel.attach(Arc::new(ChannelEvents {
            connection: self.weak_self.clone(),
        }));
    }

    fn remote_stream(&self, _stream: MediaStream) {
        warn!(
            target: "peerlink::connection",
            connection_id = %self.core.connection_id(),
            "data connection ignoring remote media stream"
        );
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

struct ChannelEvents {
    connection: Weak<DataInner>,
}

impl ChannelListener for ChannelEvents {
    fn opened(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.channel_opened();
        }
    }

    fn frame(&self, frame: Frame) {
        if let Some(connection) = self.connection.upgrade() {
            connection.handle_frame(frame);
        }
    }

    fn closed(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close();
        }
    }
}

/// Text frame carrying one byte per char, as sent by peers without binary support.
fn binary_string_to_bytes(text: &str) -> Result<Bytes, CodecError> {
    text.chars()
        .map(|ch| u8::try_from(u32::from(ch)).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
        .ok_or_else(|| CodecError::Decode("binary string contains non-byte characters".into()))
}

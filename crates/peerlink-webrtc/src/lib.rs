//! WebRTC transport provider for peerlink, built on the `webrtc` crate.
//!
//! Each negotiation runs as one task on the tokio runtime that owns the
//! `RTCPeerConnection`. The synchronous [`Negotiation`] handle only queues
//! commands for that task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peerlink::{
    Capabilities, ConnectionKind, IceCandidate, IceServer, MediaStream, Negotiation,
    NegotiationEvents, NegotiationRequest, SdpKind, TransportConfig, TransportProvider,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

mod channel;
mod media;

pub use channel::WebRtcDataChannel;
pub use media::{LocalTracks, RemoteTracks};

const TARGET: &str = "peerlink::webrtc";

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error("no tokio runtime available")]
    NoRuntime,
    #[error("webrtc setup failed: {0}")]
    Setup(String),
    #[error("answer requested without a remote offer")]
    MissingOffer,
}

fn to_setup_error(err: impl std::fmt::Display) -> WebRtcError {
    WebRtcError::Setup(err.to_string())
}

/// Negotiates real peer connections. Cheap to clone.
#[derive(Clone)]
pub struct WebRtcProvider {
    runtime: Handle,
}

impl WebRtcProvider {
    /// Uses the runtime of the calling context.
    pub fn new() -> Result<Self, WebRtcError> {
        let runtime = Handle::try_current().map_err(|_| WebRtcError::NoRuntime)?;
        Ok(Self::with_handle(runtime))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl TransportProvider for WebRtcProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn negotiate(
        &self,
        request: NegotiationRequest,
        events: Arc<dyn NegotiationEvents>,
    ) -> Arc<dyn Negotiation> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        debug!(
            target: TARGET,
            connection_id = %request.connection_id,
            peer = %request.peer,
            kind = ?request.kind,
            originator = request.originator,
            "starting negotiation"
        );
        self.runtime.spawn(run_negotiation(
            request,
            events,
            commands_rx,
            self.runtime.clone(),
        ));
        Arc::new(WebRtcNegotiation {
            commands: commands_tx,
        })
    }
}

#[derive(Debug)]
enum Command {
    RemoteSdp(SdpKind, String),
    RemoteCandidate(IceCandidate),
    Teardown,
}

pub struct WebRtcNegotiation {
    commands: mpsc::UnboundedSender<Command>,
}

impl WebRtcNegotiation {
    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!(target: TARGET, "negotiation task already finished");
        }
    }
}

impl Negotiation for WebRtcNegotiation {
    fn apply_remote_sdp(&self, kind: SdpKind, sdp: String) {
        self.submit(Command::RemoteSdp(kind, sdp));
    }

    fn apply_remote_candidate(&self, candidate: IceCandidate) {
        self.submit(Command::RemoteCandidate(candidate));
    }

    fn teardown(&self) {
        self.submit(Command::Teardown);
    }
}

fn build_api() -> Result<API, WebRtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(config: &TransportConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
        ..Default::default()
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn data_channel_init(reliable: bool) -> RTCDataChannelInit {
    if reliable {
        RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        }
    } else {
        RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        }
    }
}

fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn session_description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, WebRtcError> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(to_setup_error)
}

async fn run_negotiation(
    request: NegotiationRequest,
    events: Arc<dyn NegotiationEvents>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    runtime: Handle,
) {
    let connection_id = request.connection_id.clone();
    let mut session = match Session::open(&request, Arc::clone(&events), runtime).await {
        Ok(session) => session,
        Err(err) => {
            warn!(target: TARGET, %connection_id, error = %err, "negotiation setup failed");
            events.failed(err.to_string());
            return;
        }
    };

    while let Some(command) = commands.recv().await {
        let result = match command {
            Command::RemoteSdp(kind, sdp) => session.apply_remote_sdp(kind, sdp).await,
            Command::RemoteCandidate(candidate) => {
                session.apply_remote_candidate(candidate).await;
                Ok(())
            }
            Command::Teardown => break,
        };
        if let Err(err) = result {
            warn!(target: TARGET, %connection_id, error = %err, "negotiation failed");
            events.failed(err.to_string());
        }
    }

    debug!(target: TARGET, %connection_id, "closing peer connection");
    if let Err(err) = session.pc.close().await {
        debug!(target: TARGET, %connection_id, error = %err, "peer connection close failed");
    }
}

struct Session {
    pc: Arc<RTCPeerConnection>,
    events: Arc<dyn NegotiationEvents>,
    connection_id: String,
    runtime: Handle,
    remote_described: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl Session {
    async fn open(
        request: &NegotiationRequest,
        events: Arc<dyn NegotiationEvents>,
        runtime: Handle,
    ) -> Result<Self, WebRtcError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(&request.config))
                .await
                .map_err(to_setup_error)?,
        );
        let mut session = Self {
            pc,
            events,
            connection_id: request.connection_id.clone(),
            runtime,
            remote_described: false,
            pending_candidates: Vec::new(),
        };
        session.install_handlers(request.kind);

        match request.kind {
            ConnectionKind::Data if request.originator => {
                let dc = session
                    .pc
                    .create_data_channel(&request.label, Some(data_channel_init(request.reliable)))
                    .await
                    .map_err(to_setup_error)?;
                session.announce_channel(dc);
            }
            ConnectionKind::Data => {}
            ConnectionKind::Media => session.add_local_media(request).await?,
        }

        if request.originator {
            let offer = session.pc.create_offer(None).await.map_err(to_setup_error)?;
            let sdp = offer.sdp.clone();
            session
                .pc
                .set_local_description(offer)
                .await
                .map_err(to_setup_error)?;
            session.events.sdp_ready(SdpKind::Offer, sdp);
        } else {
            let offer = request.remote_sdp.clone().ok_or(WebRtcError::MissingOffer)?;
            session.apply_remote_sdp(SdpKind::Offer, offer).await?;
        }
        Ok(session)
    }

    fn install_handlers(&self, kind: ConnectionKind) {
        let events = Arc::clone(&self.events);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = Arc::clone(&events);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.candidate_ready(candidate_from_init(init)),
                    Err(err) => warn!(target: TARGET, error = %err, "local candidate not serialisable"),
                }
            })
        }));

        let events = Arc::clone(&self.events);
        let connection_id = self.connection_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = Arc::clone(&events);
                let connection_id = connection_id.clone();
                Box::pin(async move {
                    debug!(target: TARGET, %connection_id, ?state, "peer connection state");
                    if state == RTCPeerConnectionState::Failed {
                        events.failed("peer connection failed".into());
                    }
                })
            }));

        match kind {
            ConnectionKind::Data => {
                let events = Arc::clone(&self.events);
                let runtime = self.runtime.clone();
                self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = Arc::clone(&events);
                    let runtime = runtime.clone();
                    Box::pin(async move {
                        debug!(target: TARGET, label = %dc.label(), "remote data channel announced");
                        events.channel_ready(WebRtcDataChannel::wrap(dc, &runtime));
                    })
                }));
            }
            ConnectionKind::Media => {
                let events = Arc::clone(&self.events);
                let streams: Arc<Mutex<HashMap<String, Arc<RemoteTracks>>>> =
                    Arc::new(Mutex::new(HashMap::new()));
                self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                    let events = Arc::clone(&events);
                    let streams = Arc::clone(&streams);
                    Box::pin(async move {
                        let stream_id = track.stream_id();
                        debug!(target: TARGET, %stream_id, track_id = %track.id(), "remote track");
                        let announce = {
                            let mut streams = streams.lock();
                            match streams.get(&stream_id) {
                                Some(existing) => {
                                    existing.push(track);
                                    None
                                }
                                None => {
                                    let remote = Arc::new(RemoteTracks::default());
                                    remote.push(track);
                                    streams.insert(stream_id.clone(), Arc::clone(&remote));
                                    Some(remote)
                                }
                            }
                        };
                        if let Some(remote) = announce {
                            events.remote_stream(MediaStream::new(stream_id, remote));
                        }
                    })
                }));
            }
        }
    }

    fn announce_channel(&self, dc: Arc<RTCDataChannel>) {
        self.events
            .channel_ready(WebRtcDataChannel::wrap(dc, &self.runtime));
    }

    async fn add_local_media(&self, request: &NegotiationRequest) -> Result<(), WebRtcError> {
        let tracks = media::local_tracks(request.local_stream.as_ref());
        if tracks.is_empty() && request.originator {
            // Still ask for the remote side's audio and video.
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                self.pc
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(to_setup_error)?;
            }
        }
        for track in tracks {
            self.pc.add_track(track).await.map_err(to_setup_error)?;
        }
        Ok(())
    }

    async fn apply_remote_sdp(&mut self, kind: SdpKind, sdp: String) -> Result<(), WebRtcError> {
        trace!(target: TARGET, connection_id = %self.connection_id, ?kind, "applying remote description");
        self.pc
            .set_remote_description(session_description(kind, sdp)?)
            .await
            .map_err(to_setup_error)?;
        self.remote_described = true;
        for init in std::mem::take(&mut self.pending_candidates) {
            self.add_candidate(init).await;
        }

        if kind == SdpKind::Offer {
            let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
            let sdp = answer.sdp.clone();
            self.pc
                .set_local_description(answer)
                .await
                .map_err(to_setup_error)?;
            self.events.sdp_ready(SdpKind::Answer, sdp);
        }
        Ok(())
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        let init = candidate_init(candidate);
        if self.remote_described {
            self.add_candidate(init).await;
        } else {
            self.pending_candidates.push(init);
        }
    }

    async fn add_candidate(&self, init: RTCIceCandidateInit) {
        if let Err(err) = self.pc.add_ice_candidate(init).await {
            warn!(
                target: TARGET,
                connection_id = %self.connection_id,
                error = %err,
                "failed to add remote ice candidate"
            );
        }
    }
}

//! Payloads carried inside [`MediaStream`] handles by the WebRTC provider.

use std::sync::Arc;

use parking_lot::Mutex;
use peerlink::MediaStream;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Outgoing tracks. Wrap them in a stream with [`LocalTracks::into_stream`]
/// and pass that to `Peer::call` or `MediaConnection::answer`.
#[derive(Clone, Default)]
pub struct LocalTracks {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }

    pub fn push(&mut self, track: Arc<dyn TrackLocal + Send + Sync>) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn into_stream(self, id: impl Into<String>) -> MediaStream {
        MediaStream::new(id, Arc::new(self))
    }
}

/// Incoming tracks sharing one remote stream id. Tracks that arrive after
/// the stream was announced are appended here.
#[derive(Default)]
pub struct RemoteTracks {
    tracks: Mutex<Vec<Arc<TrackRemote>>>,
}

impl RemoteTracks {
    pub(crate) fn push(&self, track: Arc<TrackRemote>) {
        self.tracks.lock().push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }
}

/// Local tracks found in a stream handle; empty for handles from other providers.
pub(crate) fn local_tracks(stream: Option<&MediaStream>) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
    stream
        .and_then(|stream| stream.downcast::<LocalTracks>())
        .map(|local| local.tracks.clone())
        .unwrap_or_default()
}

//! Adapts an `RTCDataChannel` to the synchronous [`DataChannel`] seam.
//!
//! Writes are queued to a writer task on the runtime; `buffered_amount`
//! reports bytes still queued locally plus what the SCTP stack last reported.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink::{ChannelError, ChannelListener, DataChannel, Frame};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

const TARGET: &str = "peerlink::webrtc::channel";

pub struct WebRtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    shared: Arc<Shared>,
    runtime: Handle,
}

struct Shared {
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    listener: Option<Arc<dyn ChannelListener>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    open: bool,
    open_notified: bool,
    closed: bool,
    inbox: VecDeque<Frame>,
    queued: usize,
    reported: usize,
}

impl WebRtcDataChannel {
    /// Install callbacks on `dc` and start its writer task.
    pub fn wrap(dc: Arc<RTCDataChannel>, runtime: &Handle) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState {
                outbound: Some(outbound_tx),
                ..Default::default()
            }),
        });
        let label = dc.label().to_string();

        let on_open = Arc::clone(&shared);
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let shared = Arc::clone(&on_open);
            let label = open_label.clone();
            Box::pin(async move {
                debug!(target: TARGET, %label, "data channel opened");
                shared.opened();
            })
        }));

        let on_message = Arc::clone(&shared);
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let shared = Arc::clone(&on_message);
            Box::pin(async move {
                shared.deliver(frame_from_message(message));
            })
        }));

        let on_close = Arc::clone(&shared);
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let shared = Arc::clone(&on_close);
            let label = close_label.clone();
            Box::pin(async move {
                debug!(target: TARGET, %label, "data channel closed by transport");
                shared.remote_closed();
            })
        }));

        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                warn!(target: TARGET, %label, error = %err, "data channel error");
            })
        }));

        runtime.spawn(write_loop(
            Arc::clone(&dc),
            Arc::clone(&shared),
            outbound_rx,
        ));

        // The channel may have opened before `on_open` was installed.
        if dc.ready_state() == RTCDataChannelState::Open {
            shared.opened();
        }

        Arc::new(Self {
            label,
            dc,
            shared,
            runtime: runtime.clone(),
        })
    }
}

impl Shared {
    fn opened(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.open || state.closed {
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
            state.outbound = None;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.closed();
        }
    }

    fn written(&self, len: usize, reported: usize) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(len);
        state.reported = reported;
    }
}

async fn write_loop(
    dc: Arc<RTCDataChannel>,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let len = frame.len();
        let result = match frame {
            Frame::Text(text) => dc.send_text(text).await,
            Frame::Binary(bytes) => dc.send(&bytes).await,
        };
        if let Err(err) = result {
            warn!(target: TARGET, label = %dc.label(), error = %err, "data channel write failed");
            shared.remote_closed();
            break;
        }
        trace!(target: TARGET, len, "sent frame");
        let reported = dc.buffered_amount().await;
        shared.written(len, reported);
    }
    trace!(target: TARGET, label = %dc.label(), "writer loop finished");
}

fn frame_from_message(message: DataChannelMessage) -> Frame {
    if message.is_string {
        Frame::Text(String::from_utf8_lossy(&message.data).into_owned())
    } else {
        Frame::Binary(Bytes::clone(&message.data))
    }
}

impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    fn buffered_amount(&self) -> usize {
        let state = self.shared.state.lock();
        state.queued + state.reported
    }

    fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        if !state.open {
            return Err(ChannelError::Closed);
        }
        let outbound = state.outbound.as_ref().ok_or(ChannelError::Closed)?;
        outbound
            .send(frame.clone())
            .map_err(|_| ChannelError::Send("writer task stopped".into()))?;
        state.queued += frame.len();
        Ok(())
    }

    fn attach(&self, listener: Arc<dyn ChannelListener>) {
        let (backlog, notify_open) = {
            let mut state = self.shared.state.lock();
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
        self.shared.state.lock().listener = None;
    }

    fn close(&self) {
        let listener = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.outbound = None;
            state.inbox.clear();
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.closed();
        }
        let dc = Arc::clone(&self.dc);
        self.runtime.spawn(async move {
            if let Err(err) = dc.close().await {
                debug!(target: TARGET, label = %dc.label(), error = %err, "data channel close failed");
            }
        });
    }
}

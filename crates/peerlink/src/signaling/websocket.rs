use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, trace, warn};
use url::Url;

use super::{LinkListener, SignalingConnector, SignalingLink};
use crate::error::SignalingError;

/// Signaling links over `tokio-tungstenite`. Requires a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SignalingConnector for WebSocketConnector {
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn LinkListener>,
    ) -> Result<Arc<dyn SignalingLink>, SignalingError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SignalingError::Runtime(err.to_string()))?;
        let (send_tx, send_rx) = mpsc::unbounded_channel::<String>();
        let writable = Arc::new(AtomicBool::new(false));
        runtime.spawn(run_link(url, listener, send_rx, Arc::clone(&writable)));
        Ok(Arc::new(WebSocketLink {
            send_tx: Mutex::new(Some(send_tx)),
            writable,
        }))
    }
}

struct WebSocketLink {
    send_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    writable: Arc<AtomicBool>,
}

impl SignalingLink for WebSocketLink {
    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst) && self.send_tx.lock().is_some()
    }

    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let guard = self.send_tx.lock();
        let sender = guard.as_ref().ok_or(SignalingError::ChannelClosed)?;
        sender.send(text).map_err(|_| SignalingError::ChannelClosed)
    }

    fn close(&self) {
        self.writable.store(false, Ordering::SeqCst);
        // dropping the sender makes the writer send a close frame and exit
        self.send_tx.lock().take();
    }
}

async fn run_link(
    url: Url,
    listener: Arc<dyn LinkListener>,
    mut send_rx: mpsc::UnboundedReceiver<String>,
    writable: Arc<AtomicBool>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!(target: "peerlink::signaling", url = %url, error = %err, "websocket connect failed");
            listener.closed();
            return;
        }
    };
    debug!(target: "peerlink::signaling", url = %url, "signaling websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();
    writable.store(true, Ordering::SeqCst);
    listener.opened();

    loop {
        tokio::select! {
            outbound = send_rx.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = ws_write.send(Message::Text(text)).await {
                        warn!(target: "peerlink::signaling", error = %err, "signaling websocket write failed");
                        break;
                    }
                }
                None => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    trace!(target: "peerlink::signaling", kind = "text", len = text.len(), "ws_in");
                    listener.message(text);
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(target: "peerlink::signaling", kind = "binary", len = data.len(), "ws_in");
                    if let Ok(text) = String::from_utf8(data) {
                        listener.message(text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            debug!(target: "peerlink::signaling", "signaling websocket closed: {err}");
                        }
                        _ => {
                            warn!(target: "peerlink::signaling", "signaling websocket error: {err}");
                        }
                    }
                    break;
                }
            },
        }
    }

    writable.store(false, Ordering::SeqCst);
    listener.closed();
}

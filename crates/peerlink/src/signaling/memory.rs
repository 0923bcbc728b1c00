//! In-process signaling link driven by the caller instead of a server.

use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use super::{LinkListener, ServerMessage, SignalingConnector, SignalingLink};
use crate::error::SignalingError;

#[derive(Clone, Default)]
pub struct MemoryConnector {
    links: Arc<Mutex<Vec<MemoryLinkHandle>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links(&self) -> Vec<MemoryLinkHandle> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Option<MemoryLinkHandle> {
        self.links.lock().last().cloned()
    }
}

impl SignalingConnector for MemoryConnector {
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn LinkListener>,
    ) -> Result<Arc<dyn SignalingLink>, SignalingError> {
        let link = Arc::new(MemoryLink {
            url,
            listener,
            state: Mutex::new(LinkState::default()),
        });
        self.links.lock().push(MemoryLinkHandle {
            link: Arc::clone(&link),
        });
        Ok(link)
    }
}

#[derive(Default)]
struct LinkState {
    open: bool,
    writable: bool,
    closed: bool,
    sent: Vec<String>,
}

struct MemoryLink {
    url: Url,
    listener: Arc<dyn LinkListener>,
    state: Mutex<LinkState>,
}

impl SignalingLink for MemoryLink {
    fn is_writable(&self) -> bool {
        let state = self.state.lock();
        state.open && state.writable && !state.closed
    }

    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !(state.open && state.writable) || state.closed {
            return Err(SignalingError::ChannelClosed);
        }
        state.sent.push(text);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Test-side view of one link: plays the server's part.
#[derive(Clone)]
pub struct MemoryLinkHandle {
    link: Arc<MemoryLink>,
}

impl MemoryLinkHandle {
    pub fn url(&self) -> &Url {
        &self.link.url
    }

    pub fn open(&self) {
        {
            let mut state = self.link.state.lock();
            if state.closed {
                return;
            }
            state.open = true;
            state.writable = true;
        }
        self.link.listener.opened();
    }

    pub fn deliver(&self, text: impl Into<String>) {
        if self.link.state.lock().closed {
            return;
        }
        self.link.listener.message(text.into());
    }

    pub fn deliver_message(&self, message: &ServerMessage) {
        if let Ok(text) = serde_json::to_string(message) {
            self.deliver(text);
        }
    }

    /// The remote end went away.
    pub fn drop_link(&self) {
        {
            let mut state = self.link.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
        }
        self.link.listener.closed();
    }

    pub fn set_writable(&self, writable: bool) {
        self.link.state.lock().writable = writable;
    }

    pub fn is_closed(&self) -> bool {
        self.link.state.lock().closed
    }

    pub fn sent(&self) -> Vec<String> {
        self.link.state.lock().sent.clone()
    }

    pub fn sent_messages(&self) -> Vec<ServerMessage> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Remove and return everything sent so far.
    pub fn take_sent(&self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.link.state.lock().sent)
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }
}

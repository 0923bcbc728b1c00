use std::collections::HashMap;

use crate::signaling::ServerMessage;

/// Signaling messages that arrived before their connection existed, keyed by connection id.
#[derive(Debug, Default)]
pub struct LostMessageStore {
    messages: HashMap<String, Vec<ServerMessage>>,
}

impl LostMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, connection_id: &str, message: ServerMessage) {
        self.messages
            .entry(connection_id.to_string())
            .or_default()
            .push(message);
    }

    /// Remove and return everything held for `connection_id`, oldest first.
    pub fn take(&mut self, connection_id: &str) -> Vec<ServerMessage> {
        self.messages.remove(connection_id).unwrap_or_default()
    }

    pub fn discard(&mut self, connection_id: &str) {
        self.messages.remove(connection_id);
    }

    pub fn pending(&self, connection_id: &str) -> usize {
        self.messages.get(connection_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

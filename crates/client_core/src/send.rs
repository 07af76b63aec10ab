use std::sync::Arc;

use shared::{
    domain::ChannelKey,
    protocol::{ChatMessage, LiveEmit},
};
use tracing::{debug, warn};

use crate::{
    error::ChatError,
    store::ChannelStore,
    transport::{ChatApi, LiveConnection},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Handed to the live channel. Nothing is written locally; the server's
    /// echo comes back through the live bridge.
    Emitted,
    /// Sent by request and appended to the store as read.
    Stored(ChatMessage),
}

/// Picks the live channel when it is up and the request endpoint otherwise.
pub struct SendPathSelector {
    store: Arc<ChannelStore>,
    api: Arc<dyn ChatApi>,
    live: Arc<dyn LiveConnection>,
}

impl SendPathSelector {
    pub fn new(
        store: Arc<ChannelStore>,
        api: Arc<dyn ChatApi>,
        live: Arc<dyn LiveConnection>,
    ) -> Self {
        Self { store, api, live }
    }

    pub async fn send(&self, channel: ChannelKey, body: &str) -> Result<SendOutcome, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        if self.live.status().is_connected() {
            match self.live.emit(LiveEmit::for_channel(channel, body)) {
                Ok(()) => {
                    debug!(channel = %channel, "chat: message emitted on live channel");
                    return Ok(SendOutcome::Emitted);
                }
                // The connection dropped after the status check.
                Err(err) => {
                    warn!(channel = %channel, "chat: live emit failed, sending by request: {err}")
                }
            }
        }

        let message = self
            .api
            .send(channel, body)
            .await
            .map_err(|source| ChatError::Send { channel, source })?;
        self.store.append(channel, message.clone(), true);
        debug!(channel = %channel, message_id = message.id.0, "chat: message stored after request send");
        Ok(SendOutcome::Stored(message))
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;

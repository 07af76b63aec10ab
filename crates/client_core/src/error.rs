use shared::domain::ChannelKey;
use thiserror::Error;

/// Failures surfaced at the reconciler / send-path boundary.
///
/// Store operations never fail; everything here comes from an asynchronous
/// fetch or send and is meant for user-facing display.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat session not started")]
    NotStarted,
    #[error("message body is empty")]
    EmptyMessage,
    #[error("failed to load history for {channel}: {source}")]
    History {
        channel: ChannelKey,
        source: anyhow::Error,
    },
    #[error("failed to send message to {channel}: {source}")]
    Send {
        channel: ChannelKey,
        source: anyhow::Error,
    },
}

impl ChatError {
    pub fn channel(&self) -> Option<ChannelKey> {
        match self {
            ChatError::History { channel, .. } | ChatError::Send { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// The server rejected the session's credentials.
    pub fn requires_reauth(&self) -> bool {
        let source = match self {
            ChatError::History { source, .. } | ChatError::Send { source, .. } => source,
            _ => return false,
        };
        source
            .downcast_ref::<shared::error::ApiError>()
            .is_some_and(|err| err.requires_reauth())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LiveError {
    #[error("not connected")]
    NotConnected,
    #[error("outbound queue closed")]
    Closed,
    #[error("failed to encode live frame: {0}")]
    Encode(String),
}

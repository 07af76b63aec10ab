use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelKey, MessageId, Role, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            _ => self.username.clone(),
        }
    }
}

/// A chat message as served by the history endpoints and the live channel.
///
/// `id` is the only identity: two values with the same id are the same
/// message no matter which transport delivered them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(rename = "userId")]
    pub sender_id: UserId,
    #[serde(rename = "user")]
    pub sender: UserProfile,
    #[serde(rename = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserProfile>,
    #[serde(default)]
    pub is_private: bool,
}

impl ChatMessage {
    /// Ordering key for rendering: timestamp first, id breaks ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}

pub fn private_peer(
    sender_id: UserId,
    recipient_id: Option<UserId>,
    own_user_id: UserId,
) -> Option<UserId> {
    let peer = if sender_id == own_user_id {
        recipient_id?
    } else {
        sender_id
    };
    peer.is_usable().then_some(peer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveEventKind {
    PublicMessage,
    PrivateMessage,
    PrivateMessageSent,
}

impl LiveEventKind {
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "public-message" => Some(Self::PublicMessage),
            "private-message" => Some(Self::PrivateMessage),
            "private-message-sent" => Some(Self::PrivateMessageSent),
            _ => None,
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Self::PublicMessage => "public-message",
            Self::PrivateMessage => "private-message",
            Self::PrivateMessageSent => "private-message-sent",
        }
    }
}

/// Raw frame read off the live channel: `{"event": "...", "data": ...}`.
///
/// The payload is kept loosely typed; it is only coerced into a
/// [`ChatMessage`] at the delivery bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub kind: LiveEventKind,
    pub payload: serde_json::Value,
}

impl LiveEvent {
    pub fn new(kind: LiveEventKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }

    pub fn from_frame(frame: LiveFrame) -> Option<Self> {
        let kind = LiveEventKind::from_event_name(&frame.event)?;
        Some(Self::new(kind, frame.data))
    }
}

/// Outbound events emitted over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum LiveEmit {
    PublicMessage(String),
    PrivateMessage(PrivateMessageEmit),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessageEmit {
    pub recipient_id: UserId,
    pub message: String,
}

impl LiveEmit {
    pub fn for_channel(channel: ChannelKey, body: &str) -> Self {
        match channel {
            ChannelKey::Public => LiveEmit::PublicMessage(body.to_string()),
            ChannelKey::Private { peer_id } => LiveEmit::PrivateMessage(PrivateMessageEmit {
                recipient_id: peer_id,
                message: body.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPublicMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPrivateMessageRequest {
    pub message: String,
    pub recipient_id: UserId,
}

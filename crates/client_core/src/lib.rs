//! Client-side chat synchronization: one canonical message store fed by live
//! delivery, history fetches and request-based sends.

pub mod bridge;
pub mod config;
pub mod conversation;
pub mod error;
pub mod persistence;
pub mod send;
pub mod session;
pub mod store;
pub mod transport;

pub use bridge::LiveDeliveryBridge;
pub use config::{load_settings, ClientSettings};
pub use conversation::{ActiveConversation, Activation, ConversationView};
pub use error::{ChatError, LiveError};
pub use persistence::{spawn_cache_writer, ChatCache};
pub use send::{SendOutcome, SendPathSelector};
pub use session::{ChatSession, SessionDeps, SessionStart};
pub use store::{merge_messages, ChannelSnapshot, ChannelStore, StoreEvent};
pub use transport::{
    live_endpoint, ChatApi, ConnectionStatus, HttpChatApi, LiveConnection, WsLiveConnection,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

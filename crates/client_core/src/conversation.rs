//! Reconciler for the conversation the user currently has open.

use std::sync::{Arc, Mutex, MutexGuard};

use shared::{domain::ChannelKey, protocol::ChatMessage};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    store::{ChannelStore, StoreEvent},
    transport::ChatApi,
};

/// Outcome of [`ActiveConversation::activate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// History was fetched and merged; holds the channel's resulting sequence.
    Reconciled(Vec<ChatMessage>),
    /// Another activation started while this one was fetching, so its result
    /// was discarded.
    Superseded,
}

/// What the open conversation should render, read from the store on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub channel: Option<ChannelKey>,
    pub messages: Vec<ChatMessage>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct ConversationState {
    generation: u64,
    channel: Option<ChannelKey>,
    loading: bool,
    error: Option<String>,
    follower: Option<JoinHandle<()>>,
}

impl ConversationState {
    fn stop_following(&mut self) {
        if let Some(follower) = self.follower.take() {
            follower.abort();
        }
    }
}

pub struct ActiveConversation {
    store: Arc<ChannelStore>,
    api: Arc<dyn ChatApi>,
    state: Mutex<ConversationState>,
}

impl ActiveConversation {
    pub fn new(store: Arc<ChannelStore>, api: Arc<dyn ChatApi>) -> Self {
        Self {
            store,
            api,
            state: Mutex::new(ConversationState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens `channel`: marks it read, fetches its history and merges it into
    /// the store.
    ///
    /// The merge re-reads the store under its lock, so live messages that
    /// arrived during the fetch survive. If another activation (or
    /// [`deactivate`](Self::deactivate)) happens meanwhile, the fetch result
    /// is dropped and [`Activation::Superseded`] is returned.
    ///
    /// A failed fetch leaves whatever was cached in place and records the
    /// error in the [`view`](Self::view).
    pub async fn activate(&self, channel: ChannelKey) -> Result<Activation, ChatError> {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.channel = Some(channel);
            state.loading = true;
            state.error = None;
            state.stop_following();
            state.follower = Some(self.follow(channel));
            state.generation
        };
        self.store.mark_read(channel);
        info!(channel = %channel, generation, "chat: conversation opened");

        let fetched = self.api.history(channel).await;

        let mut state = self.lock();
        if state.generation != generation {
            debug!(channel = %channel, generation, "chat: discarding superseded history fetch");
            return Ok(Activation::Superseded);
        }
        state.loading = false;
        match fetched {
            Ok(fetched) => {
                let fetched_len = fetched.len();
                let merged = self.store.merge_history(channel, fetched);
                debug!(
                    channel = %channel,
                    fetched = fetched_len,
                    total = merged.len(),
                    "chat: history reconciled"
                );
                Ok(Activation::Reconciled(merged))
            }
            Err(source) => {
                warn!(channel = %channel, "chat: history fetch failed: {source:#}");
                state.error = Some(format!("{source:#}"));
                Err(ChatError::History { channel, source })
            }
        }
    }

    /// Closes the conversation. An in-flight activation becomes superseded.
    pub fn deactivate(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.stop_following();
        if let Some(channel) = state.channel.take() {
            info!(channel = %channel, "chat: conversation closed");
        }
        state.loading = false;
        state.error = None;
    }

    pub fn view(&self) -> ConversationView {
        let state = self.lock();
        let Some(channel) = state.channel else {
            return ConversationView::default();
        };
        ConversationView {
            channel: Some(channel),
            messages: self.store.messages(channel),
            loading: state.loading,
            error: state.error.clone(),
        }
    }

    /// Keeps `channel` read while it stays open.
    fn follow(&self, channel: ChannelKey) -> JoinHandle<()> {
        let mut events = self.store.subscribe();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::MessageAppended {
                        channel: appended, ..
                    }) if appended == channel => store.mark_read(channel),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => store.mark_read(channel),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for ActiveConversation {
    fn drop(&mut self) {
        self.lock().stop_following();
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;

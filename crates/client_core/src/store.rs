//! Canonical message cache shared by the live bridge and open conversations.
//!
//! Every mutation runs under one short, synchronous critical section and
//! publishes a [`StoreEvent`] before the lock is released, so subscribers see
//! mutations in exactly the order they were applied.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use shared::{
    domain::{ChannelKey, MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ChannelReplaced {
        channel: ChannelKey,
    },
    MessageAppended {
        channel: ChannelKey,
        message: ChatMessage,
    },
    UnreadChanged {
        channel: ChannelKey,
        unread: u32,
    },
    Reset,
}

impl StoreEvent {
    pub fn channel(&self) -> Option<ChannelKey> {
        match self {
            StoreEvent::ChannelReplaced { channel }
            | StoreEvent::MessageAppended { channel, .. }
            | StoreEvent::UnreadChanged { channel, .. } => Some(*channel),
            StoreEvent::Reset => None,
        }
    }
}

/// Point-in-time copy of the whole store, used to persist and restore it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub public: Vec<ChatMessage>,
    pub private: BTreeMap<UserId, Vec<ChatMessage>>,
    pub unread_public: u32,
    pub unread_private: BTreeMap<UserId, u32>,
}

impl ChannelSnapshot {
    pub fn channels(&self) -> impl Iterator<Item = (ChannelKey, &[ChatMessage])> {
        std::iter::once((ChannelKey::Public, self.public.as_slice())).chain(
            self.private
                .iter()
                .map(|(peer_id, messages)| (ChannelKey::private(*peer_id), messages.as_slice())),
        )
    }

    pub fn unread_counts(&self) -> impl Iterator<Item = (ChannelKey, u32)> + '_ {
        std::iter::once((ChannelKey::Public, self.unread_public)).chain(
            self.unread_private
                .iter()
                .map(|(peer_id, unread)| (ChannelKey::private(*peer_id), *unread)),
        )
    }
}

#[derive(Debug, Default)]
struct ChannelLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
}

impl ChannelLog {
    fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let mut log = ChannelLog::default();
        for message in messages {
            log.insert(message);
        }
        log
    }

    /// Insert-or-ignore by id, keeping timestamp order.
    fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let key = message.sort_key();
        let at = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(at, message);
        true
    }
}

#[derive(Debug, Default)]
struct StoreState {
    public: ChannelLog,
    private: HashMap<UserId, ChannelLog>,
    unread_public: u32,
    unread_private: HashMap<UserId, u32>,
}

impl StoreState {
    fn log(&self, channel: ChannelKey) -> Option<&ChannelLog> {
        match channel {
            ChannelKey::Public => Some(&self.public),
            ChannelKey::Private { peer_id } => self.private.get(&peer_id),
        }
    }

    fn log_mut(&mut self, channel: ChannelKey) -> &mut ChannelLog {
        match channel {
            ChannelKey::Public => &mut self.public,
            ChannelKey::Private { peer_id } => self.private.entry(peer_id).or_default(),
        }
    }

    fn unread_mut(&mut self, channel: ChannelKey) -> &mut u32 {
        match channel {
            ChannelKey::Public => &mut self.unread_public,
            ChannelKey::Private { peer_id } => self.unread_private.entry(peer_id).or_insert(0),
        }
    }

    fn unread(&self, channel: ChannelKey) -> u32 {
        match channel {
            ChannelKey::Public => self.unread_public,
            ChannelKey::Private { peer_id } => {
                self.unread_private.get(&peer_id).copied().unwrap_or(0)
            }
        }
    }
}

pub struct ChannelStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChannelStore {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // No mutation can panic half-way, so a poisoned state is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// Replaces a channel's sequence wholesale. Input is re-sorted and
    /// de-duplicated so the ordering invariant holds whatever the caller passed.
    pub fn set_initial(&self, channel: ChannelKey, messages: Vec<ChatMessage>) {
        let mut state = self.lock();
        *state.log_mut(channel) = ChannelLog::from_messages(messages);
        self.publish(StoreEvent::ChannelReplaced { channel });
    }

    pub fn set_initial_public(&self, messages: Vec<ChatMessage>) {
        self.set_initial(ChannelKey::Public, messages);
    }

    pub fn set_initial_private(&self, peer_id: UserId, messages: Vec<ChatMessage>) {
        self.set_initial(ChannelKey::private(peer_id), messages);
    }

    /// Insert-or-ignore by id. A newly inserted message bumps the unread
    /// counter unless `is_active`; a duplicate changes nothing.
    ///
    /// Returns whether the message was inserted.
    pub fn append(&self, channel: ChannelKey, message: ChatMessage, is_active: bool) -> bool {
        let mut state = self.lock();
        let message_id = message.id;
        if !state.log_mut(channel).insert(message.clone()) {
            debug!(channel = %channel, message_id = message_id.0, "chat: duplicate message ignored");
            return false;
        }
        self.publish(StoreEvent::MessageAppended { channel, message });

        if !is_active {
            let unread = state.unread_mut(channel);
            *unread = unread.saturating_add(1);
            let unread = *unread;
            self.publish(StoreEvent::UnreadChanged { channel, unread });
        }
        true
    }

    pub fn mark_read(&self, channel: ChannelKey) {
        let mut state = self.lock();
        let unread = state.unread_mut(channel);
        if *unread == 0 {
            return;
        }
        *unread = 0;
        self.publish(StoreEvent::UnreadChanged { channel, unread: 0 });
    }

    /// Merges `fetched` into whatever the channel holds *right now* and writes
    /// the result back, all under one lock. Messages delivered live while the
    /// fetch was in flight are therefore kept.
    pub fn merge_history(&self, channel: ChannelKey, fetched: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut state = self.lock();
        let cached = state
            .log(channel)
            .map(|log| log.messages.clone())
            .unwrap_or_default();
        let merged = merge_messages(cached, fetched);
        *state.log_mut(channel) = ChannelLog::from_messages(merged.clone());
        self.publish(StoreEvent::ChannelReplaced { channel });
        merged
    }

    /// Clears every channel and counter.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = StoreState::default();
        self.publish(StoreEvent::Reset);
    }

    /// Replaces the whole store with a previously taken snapshot.
    pub fn restore(&self, snapshot: ChannelSnapshot) {
        let mut state = self.lock();
        *state = StoreState {
            public: ChannelLog::from_messages(snapshot.public),
            private: snapshot
                .private
                .into_iter()
                .map(|(peer_id, messages)| (peer_id, ChannelLog::from_messages(messages)))
                .collect(),
            unread_public: snapshot.unread_public,
            unread_private: snapshot.unread_private.into_iter().collect(),
        };
        self.publish(StoreEvent::Reset);
        self.publish(StoreEvent::ChannelReplaced {
            channel: ChannelKey::Public,
        });
        for peer_id in state.private.keys() {
            self.publish(StoreEvent::ChannelReplaced {
                channel: ChannelKey::private(*peer_id),
            });
        }
    }

    pub fn messages(&self, channel: ChannelKey) -> Vec<ChatMessage> {
        self.lock()
            .log(channel)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn unread(&self, channel: ChannelKey) -> u32 {
        self.lock().unread(channel)
    }

    pub fn total_unread(&self) -> u32 {
        let state = self.lock();
        state
            .unread_private
            .values()
            .fold(state.unread_public, |total, unread| total.saturating_add(*unread))
    }

    pub fn private_peers(&self) -> Vec<UserId> {
        let state = self.lock();
        let mut peers: Vec<_> = state
            .private
            .keys()
            .chain(state.unread_private.keys())
            .copied()
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.lock();
        ChannelSnapshot {
            public: state.public.messages.clone(),
            private: state
                .private
                .iter()
                .map(|(peer_id, log)| (*peer_id, log.messages.clone()))
                .collect(),
            unread_public: state.unread_public,
            unread_private: state
                .unread_private
                .iter()
                .map(|(peer_id, unread)| (*peer_id, *unread))
                .collect(),
        }
    }
}

/// Union of `cached` and `fetched` keyed by id, sorted by timestamp then id.
/// When both hold the same id the fetched copy wins.
pub fn merge_messages(cached: Vec<ChatMessage>, fetched: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut by_id: HashMap<MessageId, ChatMessage> =
        HashMap::with_capacity(cached.len() + fetched.len());
    for message in cached.into_iter().chain(fetched) {
        by_id.insert(message.id, message);
    }
    let mut merged: Vec<_> = by_id.into_values().collect();
    merged.sort_by_key(ChatMessage::sort_key);
    merged
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

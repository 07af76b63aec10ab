//! Builders and in-memory transports shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{ChannelKey, MessageId, Role, UserId},
    protocol::{ChatMessage, LiveEmit, LiveEvent, LiveEventKind, UserProfile},
};
use tokio::sync::{broadcast, oneshot, watch};

use crate::{
    error::LiveError,
    transport::{ChatApi, ConnectionStatus, LiveConnection},
};

pub fn profile(id: i64) -> UserProfile {
    UserProfile {
        id: UserId(id),
        username: format!("user{id}"),
        role: Role::Alumno,
        first_name: None,
        last_name: None,
    }
}

/// A message sent at `10:00:<second>`.
pub fn public_message(id: i64, sender: i64, second: u32) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        sender_id: UserId(sender),
        sender: profile(sender),
        body: format!("message {id}"),
        timestamp: Utc
            .with_ymd_and_hms(2024, 3, 1, 10, 0, second)
            .single()
            .expect("timestamp"),
        recipient_id: None,
        recipient: None,
        is_private: false,
    }
}

pub fn private_message(id: i64, sender: i64, recipient: i64, second: u32) -> ChatMessage {
    ChatMessage {
        recipient_id: Some(UserId(recipient)),
        recipient: Some(profile(recipient)),
        is_private: true,
        ..public_message(id, sender, second)
    }
}

pub fn ids(messages: &[ChatMessage]) -> Vec<i64> {
    messages.iter().map(|m| m.id.0).collect()
}

pub fn live_event(kind: LiveEventKind, message: &ChatMessage) -> LiveEvent {
    LiveEvent::new(kind, serde_json::to_value(message).expect("encode"))
}

/// Polls `check` until it holds or a second has passed.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

enum HistoryReply {
    Ready(Result<Vec<ChatMessage>>),
    Gated(oneshot::Receiver<Result<Vec<ChatMessage>>>),
}

/// Scripted [`ChatApi`]: each history call pops the next queued reply for
/// its channel, and gated replies block until the test releases them.
#[derive(Default)]
pub struct FakeChatApi {
    history: StdMutex<HashMap<ChannelKey, VecDeque<HistoryReply>>>,
    sends: StdMutex<VecDeque<Result<ChatMessage>>>,
    pub history_calls: StdMutex<Vec<ChannelKey>>,
    pub send_calls: StdMutex<Vec<(ChannelKey, String)>>,
    pub contacts: StdMutex<Vec<UserProfile>>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_history(&self, channel: ChannelKey, messages: Vec<ChatMessage>) {
        self.push_history(channel, HistoryReply::Ready(Ok(messages)));
    }

    pub fn queue_history_error(&self, channel: ChannelKey, message: &str) {
        self.push_history(channel, HistoryReply::Ready(Err(anyhow!(message.to_string()))));
    }

    /// Queues a reply that stays in flight until the returned sender fires.
    pub fn gate_history(&self, channel: ChannelKey) -> oneshot::Sender<Result<Vec<ChatMessage>>> {
        let (tx, rx) = oneshot::channel();
        self.push_history(channel, HistoryReply::Gated(rx));
        tx
    }

    pub fn queue_send(&self, reply: Result<ChatMessage>) {
        self.sends.lock().expect("sends").push_back(reply);
    }

    fn push_history(&self, channel: ChannelKey, reply: HistoryReply) {
        self.history
            .lock()
            .expect("history")
            .entry(channel)
            .or_default()
            .push_back(reply);
    }

    pub fn history_call_count(&self) -> usize {
        self.history_calls.lock().expect("calls").len()
    }

    pub fn send_call_count(&self) -> usize {
        self.send_calls.lock().expect("calls").len()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn history(&self, channel: ChannelKey) -> Result<Vec<ChatMessage>> {
        self.history_calls.lock().expect("calls").push(channel);
        let reply = self
            .history
            .lock()
            .expect("history")
            .get_mut(&channel)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(HistoryReply::Ready(result)) => result,
            Some(HistoryReply::Gated(rx)) => rx.await.map_err(|_| anyhow!("gate dropped"))?,
            None => Ok(Vec::new()),
        }
    }

    async fn send(&self, channel: ChannelKey, body: &str) -> Result<ChatMessage> {
        self.send_calls
            .lock()
            .expect("calls")
            .push((channel, body.to_string()));
        self.sends
            .lock()
            .expect("sends")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted send reply")))
    }

    async fn contacts(&self) -> Result<Vec<UserProfile>> {
        Ok(self.contacts.lock().expect("contacts").clone())
    }
}

/// In-memory [`LiveConnection`] driven by the test.
pub struct FakeLiveConnection {
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<LiveEvent>,
    epoch: AtomicU64,
    pub connect_calls: AtomicU64,
    pub refuse_connects: StdMutex<bool>,
    pub emitted: StdMutex<Vec<LiveEmit>>,
    pub fail_emits: StdMutex<bool>,
    /// Pushed as soon as the next `connect` comes online.
    pub on_connect: StdMutex<Vec<LiveEvent>>,
}

impl FakeLiveConnection {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            status,
            events,
            epoch: AtomicU64::new(0),
            connect_calls: AtomicU64::new(0),
            refuse_connects: StdMutex::new(false),
            emitted: StdMutex::new(Vec::new()),
            fail_emits: StdMutex::new(false),
            on_connect: StdMutex::new(Vec::new()),
        })
    }

    pub fn connected() -> Arc<Self> {
        let live = Self::new();
        live.go_online();
        live
    }

    pub fn go_online(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(ConnectionStatus::Connected { epoch });
        epoch
    }

    pub fn go_offline(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub fn deliver(&self, event: LiveEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn connect_call_count(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> Vec<LiveEmit> {
        self.emitted.lock().expect("emitted").clone()
    }
}

#[async_trait]
impl LiveConnection for FakeLiveConnection {
    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if *self.refuse_connects.lock().expect("refuse") {
            return Err(anyhow!("connection refused"));
        }
        if !self.status().is_connected() {
            self.go_online();
        }
        let pending: Vec<LiveEvent> = self.on_connect.lock().expect("on_connect").drain(..).collect();
        for event in pending {
            self.deliver(event);
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.go_offline();
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    fn emit(&self, emit: LiveEmit) -> std::result::Result<(), LiveError> {
        if !self.status().is_connected() || *self.fail_emits.lock().expect("fail") {
            return Err(LiveError::NotConnected);
        }
        self.emitted.lock().expect("emitted").push(emit);
        Ok(())
    }
}

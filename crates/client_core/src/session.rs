//! Binds the chat core to one authenticated identity.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use shared::{
    domain::{ChannelKey, UserId},
    protocol::UserProfile,
};
use storage::Storage;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    bridge::LiveDeliveryBridge,
    config::{normalize_database_url, ClientSettings},
    conversation::{ActiveConversation, Activation, ConversationView},
    error::ChatError,
    persistence::{spawn_cache_writer, ChatCache},
    send::{SendOutcome, SendPathSelector},
    store::ChannelStore,
    transport::{
        live_endpoint, ChatApi, ConnectionStatus, HttpChatApi, LiveConnection, WsLiveConnection,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStart {
    /// A new login. Nothing cached by anyone survives.
    Fresh,
    /// The same identity coming back (e.g. a restart while still logged in).
    /// Its own cache is restored; other identities' caches are discarded.
    Resumed,
}

/// Collaborators a session runs on.
pub struct SessionDeps {
    pub api: Arc<dyn ChatApi>,
    pub live: Arc<dyn LiveConnection>,
    pub cache: Option<Arc<dyn ChatCache>>,
    pub reconnect_delay: Duration,
    pub event_buffer: usize,
}

pub struct ChatSession {
    user: UserProfile,
    store: Arc<ChannelStore>,
    api: Arc<dyn ChatApi>,
    live: Arc<dyn LiveConnection>,
    cache: Option<Arc<dyn ChatCache>>,
    bridge: Arc<LiveDeliveryBridge>,
    conversation: ActiveConversation,
    sender: SendPathSelector,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChatSession {
    /// Builds the HTTP, WebSocket and SQLite collaborators from `settings`
    /// and starts a session on them.
    pub async fn connect(
        settings: &ClientSettings,
        user: UserProfile,
        token: &str,
        mode: SessionStart,
    ) -> Result<Self> {
        let api = HttpChatApi::new(&settings.server_url, token, settings.request_timeout)?;
        let live = WsLiveConnection::new(
            live_endpoint(&settings.server_url, &settings.live_path)?,
            token,
            settings.event_buffer,
        );
        let cache_url = normalize_database_url(&settings.cache_database_url);
        let cache = Storage::new(&cache_url)
            .await
            .with_context(|| format!("failed to open chat cache at {cache_url}"))?;

        Ok(Self::start(
            user,
            mode,
            SessionDeps {
                api: Arc::new(api),
                live: Arc::new(live),
                cache: Some(Arc::new(cache)),
                reconnect_delay: settings.reconnect_delay,
                event_buffer: settings.event_buffer,
            },
        )
        .await)
    }

    /// Starts a session for `user`.
    ///
    /// The store starts empty and any state left by another identity is
    /// discarded before anything is fetched. Cache and connection failures
    /// are logged; the session still works over the request path and the
    /// supervisor keeps retrying the live channel.
    pub async fn start(user: UserProfile, mode: SessionStart, deps: SessionDeps) -> Self {
        let SessionDeps {
            api,
            live,
            cache,
            reconnect_delay,
            event_buffer,
        } = deps;
        let owner = user.id;
        let store = Arc::new(ChannelStore::new(event_buffer));
        let bridge = Arc::new(LiveDeliveryBridge::new(Arc::clone(&store), owner));
        bridge.disarm();
        store.reset();

        if let Some(cache) = &cache {
            prepare_cache(cache.as_ref(), &store, owner, mode).await;
        }

        let mut tasks = Vec::new();
        if let Some(cache) = &cache {
            tasks.push(spawn_cache_writer(
                Arc::clone(&store),
                Arc::clone(cache),
                owner,
            ));
        }

        bridge.arm(live.as_ref());
        if let Err(err) = live.connect().await {
            warn!(user_id = owner.0, "live: initial connect failed: {err:#}");
        }
        tasks.push(tokio::spawn(supervise(
            Arc::clone(&live),
            Arc::clone(&bridge),
            reconnect_delay,
        )));
        info!(user_id = owner.0, ?mode, "chat: session started");

        Self {
            conversation: ActiveConversation::new(Arc::clone(&store), Arc::clone(&api)),
            sender: SendPathSelector::new(Arc::clone(&store), Arc::clone(&api), Arc::clone(&live)),
            user,
            store,
            api,
            live,
            cache,
            bridge,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn live_status(&self) -> ConnectionStatus {
        self.live.status()
    }

    fn ensure_open(&self) -> Result<(), ChatError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::NotStarted);
        }
        Ok(())
    }

    pub async fn open_conversation(&self, channel: ChannelKey) -> Result<Activation, ChatError> {
        self.ensure_open()?;
        self.conversation.activate(channel).await
    }

    pub fn close_conversation(&self) {
        self.conversation.deactivate();
    }

    pub fn conversation(&self) -> ConversationView {
        self.conversation.view()
    }

    pub async fn send(&self, channel: ChannelKey, body: &str) -> Result<SendOutcome, ChatError> {
        self.ensure_open()?;
        self.sender.send(channel, body).await
    }

    /// Everyone the user can open a private conversation with.
    pub async fn contacts(&self) -> Result<Vec<UserProfile>> {
        self.ensure_open()?;
        let mut contacts = self.api.contacts().await?;
        contacts.retain(|contact| contact.id != self.user.id && contact.id.is_usable());
        Ok(contacts)
    }

    pub fn unread(&self, channel: ChannelKey) -> u32 {
        self.store.unread(channel)
    }

    pub fn total_unread(&self) -> u32 {
        self.store.total_unread()
    }

    /// Live messages dropped because delivery fell behind. Reopening a
    /// conversation refetches them.
    pub fn skipped_live_events(&self) -> u64 {
        self.bridge.skipped_events()
    }

    /// Tears the session down: live delivery stops, the store is emptied and
    /// this identity's cache is removed. Later calls fail with
    /// [`ChatError::NotStarted`].
    pub async fn logout(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tasks();
        self.conversation.deactivate();
        self.bridge.disarm();
        self.live.disconnect();
        self.store.reset();
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.purge_owner(self.user.id).await {
                warn!(user_id = self.user.id.0, "cache: purge on logout failed: {err:#}");
            }
        }
        info!(user_id = self.user.id.0, "chat: session ended");
    }

    fn stop_tasks(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn prepare_cache(
    cache: &dyn ChatCache,
    store: &ChannelStore,
    owner: UserId,
    mode: SessionStart,
) {
    match mode {
        SessionStart::Fresh => {
            if let Err(err) = cache.purge_all().await {
                warn!(user_id = owner.0, "cache: purge before fresh session failed: {err:#}");
            }
        }
        SessionStart::Resumed => {
            if let Err(err) = cache.purge_other_owners(owner).await {
                warn!(user_id = owner.0, "cache: purge of other identities failed: {err:#}");
            }
            match cache.load(owner).await {
                Ok(snapshot) => {
                    let peers = snapshot.private.len();
                    store.restore(snapshot);
                    info!(user_id = owner.0, peers, "cache: restored chat state");
                }
                Err(err) => warn!(user_id = owner.0, "cache: restore failed: {err:#}"),
            }
        }
    }
}

/// Re-arms the bridge on every new connection epoch and reconnects after
/// `reconnect_delay` whenever the live channel drops.
async fn supervise(
    live: Arc<dyn LiveConnection>,
    bridge: Arc<LiveDeliveryBridge>,
    reconnect_delay: Duration,
) {
    let mut status = live.watch_status();
    loop {
        let current = *status.borrow_and_update();
        match current {
            ConnectionStatus::Connected { .. } => {
                bridge.arm(live.as_ref());
                if status.changed().await.is_err() {
                    break;
                }
            }
            ConnectionStatus::Disconnected => {
                tokio::time::sleep(reconnect_delay).await;
                if live.status().is_connected() {
                    continue;
                }
                match live.connect().await {
                    Ok(()) => info!(epoch = ?live.status().epoch(), "live: reconnected"),
                    Err(err) => warn!("live: reconnect failed: {err:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

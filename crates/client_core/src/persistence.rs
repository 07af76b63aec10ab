//! Per-identity persisted copy of the channel store.
//!
//! The store itself never waits on the cache: a background writer follows
//! [`StoreEvent`]s and mirrors each one into the [`ChatCache`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ChannelKey, UserId},
    protocol::ChatMessage,
};
use storage::Storage;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::store::{ChannelSnapshot, ChannelStore, StoreEvent};

#[async_trait]
pub trait ChatCache: Send + Sync {
    async fn load(&self, owner: UserId) -> Result<ChannelSnapshot>;
    async fn replace_channel(
        &self,
        owner: UserId,
        channel: ChannelKey,
        messages: &[ChatMessage],
    ) -> Result<()>;
    async fn insert_message(
        &self,
        owner: UserId,
        channel: ChannelKey,
        message: &ChatMessage,
    ) -> Result<()>;
    async fn set_unread(&self, owner: UserId, channel: ChannelKey, unread: u32) -> Result<()>;
    async fn purge_owner(&self, owner: UserId) -> Result<()>;
    async fn purge_other_owners(&self, keep: UserId) -> Result<()>;
    async fn purge_all(&self) -> Result<()>;
}

#[async_trait]
impl ChatCache for Storage {
    async fn load(&self, owner: UserId) -> Result<ChannelSnapshot> {
        let mut snapshot = ChannelSnapshot::default();
        for cached in self.load_channels(owner).await? {
            match cached.channel {
                ChannelKey::Public => snapshot.public = cached.messages,
                ChannelKey::Private { peer_id } => {
                    snapshot.private.insert(peer_id, cached.messages);
                }
            }
        }
        for cached in self.load_unread(owner).await? {
            match cached.channel {
                ChannelKey::Public => snapshot.unread_public = cached.unread,
                ChannelKey::Private { peer_id } => {
                    snapshot.unread_private.insert(peer_id, cached.unread);
                }
            }
        }
        Ok(snapshot)
    }

    async fn replace_channel(
        &self,
        owner: UserId,
        channel: ChannelKey,
        messages: &[ChatMessage],
    ) -> Result<()> {
        self.replace_channel_messages(owner, channel, messages).await
    }

    async fn insert_message(
        &self,
        owner: UserId,
        channel: ChannelKey,
        message: &ChatMessage,
    ) -> Result<()> {
        self.insert_channel_message(owner, channel, message)
            .await
            .map(|_| ())
    }

    async fn set_unread(&self, owner: UserId, channel: ChannelKey, unread: u32) -> Result<()> {
        Storage::set_unread(self, owner, channel, unread).await
    }

    async fn purge_owner(&self, owner: UserId) -> Result<()> {
        let removed = Storage::purge_owner(self, owner).await?;
        debug!(owner = owner.0, removed, "cache: purged identity");
        Ok(())
    }

    async fn purge_other_owners(&self, keep: UserId) -> Result<()> {
        let removed = Storage::purge_other_owners(self, keep).await?;
        debug!(keep = keep.0, removed, "cache: purged other identities");
        Ok(())
    }

    async fn purge_all(&self) -> Result<()> {
        let removed = Storage::purge_all(self).await?;
        debug!(removed, "cache: purged every identity");
        Ok(())
    }
}

/// Mirrors store mutations into `cache` for `owner` until the store is
/// dropped or the task is aborted. Failures are logged and skipped.
pub fn spawn_cache_writer(
    store: Arc<ChannelStore>,
    cache: Arc<dyn ChatCache>,
    owner: UserId,
) -> JoinHandle<()> {
    let mut events = store.subscribe();
    let store = Arc::downgrade(&store);
    tokio::spawn(async move {
        loop {
            let result = match events.recv().await {
                Ok(event) => {
                    let Some(store) = store.upgrade() else { break };
                    write_event(&store, cache.as_ref(), owner, event).await
                }
                Err(RecvError::Lagged(skipped)) => {
                    let Some(store) = store.upgrade() else { break };
                    warn!(owner = owner.0, skipped, "cache: writer lagged, rewriting snapshot");
                    write_snapshot(cache.as_ref(), owner, &store.snapshot()).await
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(err) = result {
                warn!(owner = owner.0, "cache: write failed: {err:#}");
            }
        }
        info!(owner = owner.0, "cache: writer stopped");
    })
}

async fn write_event(
    store: &ChannelStore,
    cache: &dyn ChatCache,
    owner: UserId,
    event: StoreEvent,
) -> Result<()> {
    match event {
        StoreEvent::ChannelReplaced { channel } => {
            cache
                .replace_channel(owner, channel, &store.messages(channel))
                .await
        }
        StoreEvent::MessageAppended { channel, message } => {
            cache.insert_message(owner, channel, &message).await
        }
        StoreEvent::UnreadChanged { channel, unread } => {
            cache.set_unread(owner, channel, unread).await
        }
        StoreEvent::Reset => cache.purge_owner(owner).await,
    }
}

/// Replaces everything cached for `owner` with `snapshot`.
pub async fn write_snapshot(
    cache: &dyn ChatCache,
    owner: UserId,
    snapshot: &ChannelSnapshot,
) -> Result<()> {
    cache.purge_owner(owner).await?;
    for (channel, messages) in snapshot.channels() {
        cache.replace_channel(owner, channel, messages).await?;
    }
    for (channel, unread) in snapshot.unread_counts() {
        cache.set_unread(owner, channel, unread).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;

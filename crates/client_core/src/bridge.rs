use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use shared::{
    domain::{ChannelKey, UserId},
    protocol::{private_peer, ChatMessage, LiveEvent, LiveEventKind},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{store::ChannelStore, transport::LiveConnection};

struct Registration {
    epoch: Option<u64>,
    task: JoinHandle<()>,
}

/// Forwards every live message into the [`ChannelStore`] for as long as the
/// session lasts, whatever conversation is open.
///
/// At most one forwarding task exists at a time. Its subscription outlives
/// reconnects, so events queued while the connection changes are still
/// delivered. Arming again for the same connection epoch is a no-op; arming
/// for a new epoch only records the epoch.
pub struct LiveDeliveryBridge {
    store: Arc<ChannelStore>,
    own_user_id: UserId,
    registration: Mutex<Option<Registration>>,
    skipped: Arc<AtomicU64>,
}

impl LiveDeliveryBridge {
    pub fn new(store: Arc<ChannelStore>, own_user_id: UserId) -> Self {
        Self {
            store,
            own_user_id,
            registration: Mutex::new(None),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn own_user_id(&self) -> UserId {
        self.own_user_id
    }

    fn lock(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` when a live registration for the current epoch
    /// already exists.
    pub fn arm(&self, live: &dyn LiveConnection) -> bool {
        let epoch = live.status().epoch();
        let mut registration = self.lock();
        if let Some(current) = registration.as_mut() {
            if !current.task.is_finished() {
                if current.epoch == epoch {
                    return false;
                }
                info!(previous = ?current.epoch, ?epoch, "live: bridge moved to new connection");
                current.epoch = epoch;
                return true;
            }
        }

        let mut events = live.subscribe();
        let store = Arc::clone(&self.store);
        let skipped_total = Arc::clone(&self.skipped);
        let own_user_id = self.own_user_id;
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        ingest(&store, own_user_id, &event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        skipped_total.fetch_add(skipped, Ordering::SeqCst);
                        warn!(
                            skipped,
                            "live: bridge fell behind; reopen conversations to refetch what was skipped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *registration = Some(Registration { epoch, task });
        info!(?epoch, user_id = own_user_id.0, "live: bridge armed");
        true
    }

    pub fn disarm(&self) {
        if let Some(previous) = self.lock().take() {
            previous.task.abort();
            info!(epoch = ?previous.epoch, "live: bridge disarmed");
        }
    }

    /// Live events lost because the forwarding task fell behind.
    pub fn skipped_events(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|current| !current.task.is_finished())
    }

    /// Applies one live event to the store. See [`ingest`].
    pub fn ingest(&self, event: &LiveEvent) -> Option<ChannelKey> {
        ingest(&self.store, self.own_user_id, event)
    }
}

impl Drop for LiveDeliveryBridge {
    fn drop(&mut self) {
        if let Some(previous) = self.lock().take() {
            previous.task.abort();
        }
    }
}

/// Coerces a live payload into a [`ChatMessage`] and appends it as unread to
/// the channel it belongs to. Payloads that do not decode, and private
/// messages without a usable peer, are dropped.
pub fn ingest(store: &ChannelStore, own_user_id: UserId, event: &LiveEvent) -> Option<ChannelKey> {
    let message: ChatMessage = match serde_json::from_value(event.payload.clone()) {
        Ok(message) => message,
        Err(err) => {
            debug!(event = event.kind.event_name(), "live: dropping malformed payload: {err}");
            return None;
        }
    };

    let channel = match event.kind {
        LiveEventKind::PublicMessage => ChannelKey::Public,
        LiveEventKind::PrivateMessage | LiveEventKind::PrivateMessageSent => {
            let Some(peer_id) = private_peer(message.sender_id, message.recipient_id, own_user_id)
            else {
                debug!(
                    event = event.kind.event_name(),
                    message_id = message.id.0,
                    "live: dropping private message without a usable peer"
                );
                return None;
            };
            ChannelKey::private(peer_id)
        }
    };

    store.append(channel, message, false);
    Some(channel)
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;

use anyhow::{anyhow, Context, Result};
use chrono::SecondsFormat;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ChannelKey, UserId},
    protocol::ChatMessage,
};

const PUBLIC_KIND: &str = "public";
const PRIVATE_KIND: &str = "private";

/// Local cache of chat channels, partitioned by the identity that owns it.
///
/// Every row carries `owner_user_id`; nothing written for one identity is
/// ever returned for another.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedChannel {
    pub channel: ChannelKey,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedUnread {
    pub channel: ChannelKey,
    pub unread: u32,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Rewrites a channel's cached sequence with `messages`.
    pub async fn replace_channel_messages(
        &self,
        owner: UserId,
        channel: ChannelKey,
        messages: &[ChatMessage],
    ) -> Result<()> {
        let (kind, peer_id) = channel_columns(channel);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chat_messages WHERE owner_user_id = ? AND channel_kind = ? AND peer_id = ?",
        )
        .bind(owner.0)
        .bind(kind)
        .bind(peer_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to clear cached channel {channel}"))?;

        for message in messages {
            let payload = encode_payload(message)?;
            sqlx::query(
                "INSERT OR IGNORE INTO chat_messages (owner_user_id, channel_kind, peer_id, message_id, sent_at, payload)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(owner.0)
            .bind(kind)
            .bind(peer_id)
            .bind(message.id.0)
            .bind(sent_at_column(message))
            .bind(payload)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to cache message {} in {channel}", message.id.0))?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Returns whether the message was newly cached.
    pub async fn insert_channel_message(
        &self,
        owner: UserId,
        channel: ChannelKey,
        message: &ChatMessage,
    ) -> Result<bool> {
        let (kind, peer_id) = channel_columns(channel);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO chat_messages (owner_user_id, channel_kind, peer_id, message_id, sent_at, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(owner.0)
        .bind(kind)
        .bind(peer_id)
        .bind(message.id.0)
        .bind(sent_at_column(message))
        .bind(encode_payload(message)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to cache message {} in {channel}", message.id.0))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_unread(&self, owner: UserId, channel: ChannelKey, unread: u32) -> Result<()> {
        let (kind, peer_id) = channel_columns(channel);
        sqlx::query(
            "INSERT INTO chat_unread (owner_user_id, channel_kind, peer_id, unread_count)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_user_id, channel_kind, peer_id)
             DO UPDATE SET unread_count = excluded.unread_count",
        )
        .bind(owner.0)
        .bind(kind)
        .bind(peer_id)
        .bind(i64::from(unread))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store unread count for {channel}"))?;
        Ok(())
    }

    /// Loads every cached channel for `owner`, each sorted by timestamp then id.
    pub async fn load_channels(&self, owner: UserId) -> Result<Vec<CachedChannel>> {
        let rows = sqlx::query(
            "SELECT channel_kind, peer_id, payload
             FROM chat_messages
             WHERE owner_user_id = ?
             ORDER BY channel_kind, peer_id, sent_at, message_id",
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;

        let mut channels: BTreeMap<ChannelKey, Vec<ChatMessage>> = BTreeMap::new();
        for row in rows {
            let channel =
                channel_from_columns(row.try_get("channel_kind")?, row.try_get("peer_id")?)?;
            let payload: String = row.try_get("payload")?;
            let message: ChatMessage = serde_json::from_str(&payload)
                .with_context(|| format!("corrupt cached message payload in {channel}"))?;
            channels.entry(channel).or_default().push(message);
        }

        Ok(channels
            .into_iter()
            .map(|(channel, mut messages)| {
                messages.sort_by_key(ChatMessage::sort_key);
                CachedChannel { channel, messages }
            })
            .collect())
    }

    pub async fn load_unread(&self, owner: UserId) -> Result<Vec<CachedUnread>> {
        let rows = sqlx::query(
            "SELECT channel_kind, peer_id, unread_count FROM chat_unread WHERE owner_user_id = ?",
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<CachedUnread> {
                let channel =
                    channel_from_columns(row.try_get("channel_kind")?, row.try_get("peer_id")?)?;
                let unread: i64 = row.try_get("unread_count")?;
                Ok(CachedUnread {
                    channel,
                    unread: u32::try_from(unread).unwrap_or(0),
                })
            })
            .collect()
    }

    pub async fn cached_owners(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT owner_user_id FROM chat_messages
             UNION
             SELECT owner_user_id FROM chat_unread
             ORDER BY owner_user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| UserId(row.get::<i64, _>(0)))
            .collect())
    }

    /// Drops everything cached for `owner`. Returns the number of rows removed.
    pub async fn purge_owner(&self, owner: UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query("DELETE FROM chat_messages WHERE owner_user_id = ?")
            .bind(owner.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let unread = sqlx::query("DELETE FROM chat_unread WHERE owner_user_id = ?")
            .bind(owner.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(messages + unread)
    }

    /// Drops everything cached for identities other than `keep`.
    pub async fn purge_other_owners(&self, keep: UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query("DELETE FROM chat_messages WHERE owner_user_id <> ?")
            .bind(keep.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let unread = sqlx::query("DELETE FROM chat_unread WHERE owner_user_id <> ?")
            .bind(keep.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(messages + unread)
    }

    pub async fn purge_all(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query("DELETE FROM chat_messages")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let unread = sqlx::query("DELETE FROM chat_unread")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(messages + unread)
    }
}

fn sent_at_column(message: &ChatMessage) -> String {
    message.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode_payload(message: &ChatMessage) -> Result<String> {
    serde_json::to_string(message)
        .with_context(|| format!("failed to encode message {}", message.id.0))
}

fn channel_columns(channel: ChannelKey) -> (&'static str, i64) {
    match channel {
        ChannelKey::Public => (PUBLIC_KIND, 0),
        ChannelKey::Private { peer_id } => (PRIVATE_KIND, peer_id.0),
    }
}

fn channel_from_columns(kind: String, peer_id: i64) -> Result<ChannelKey> {
    match kind.as_str() {
        PUBLIC_KIND => Ok(ChannelKey::Public),
        PRIVATE_KIND => Ok(ChannelKey::private(UserId(peer_id))),
        other => Err(anyhow!("unknown cached channel kind '{other}'")),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

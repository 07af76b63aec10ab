use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatSession, SendOutcome, SessionStart, StoreEvent};
use shared::{
    domain::{ChannelKey, Role, UserId},
    protocol::{ChatMessage, UserProfile},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat_cli", about = "Terminal client for the campus chat")]
struct Args {
    /// Overrides `server_url` from chat.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long, default_value = "me")]
    username: String,
    /// Start as a new login: discard every cached conversation first.
    #[arg(long)]
    fresh: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a conversation's history (public unless --peer is given).
    History {
        #[arg(long)]
        peer: Option<i64>,
    },
    /// Send a message.
    Send {
        #[arg(long)]
        peer: Option<i64>,
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// Print a conversation and keep printing new messages until Ctrl-C.
    Follow {
        #[arg(long)]
        peer: Option<i64>,
    },
    /// List users available for private conversations.
    Contacts,
    /// Show unread counters.
    Unread,
    /// End the session and drop its cached conversations.
    Logout,
}

/// The server's copy of a message this user just sent to `channel`.
fn own_echo(event: StoreEvent, channel: ChannelKey, own_id: UserId) -> Option<ChatMessage> {
    match event {
        StoreEvent::MessageAppended { channel: c, message }
            if c == channel && message.sender_id == own_id =>
        {
            Some(message)
        }
        _ => None,
    }
}

fn channel_for(peer: Option<i64>) -> Result<ChannelKey> {
    match peer.map(UserId) {
        None => Ok(ChannelKey::Public),
        Some(peer_id) if peer_id.is_usable() => Ok(ChannelKey::private(peer_id)),
        Some(peer_id) => bail!("invalid peer id {peer_id}"),
    }
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.sender.display_name(),
        message.body
    );
}

async fn open_and_print(session: &ChatSession, channel: ChannelKey) {
    if let Err(err) = session.open_conversation(channel).await {
        warn!("{err}; showing cached messages only");
    }
    for message in &session.conversation().messages {
        print_message(message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let user = UserProfile {
        id: UserId(args.user_id),
        username: args.username,
        role: Role::default(),
        first_name: None,
        last_name: None,
    };
    let mode = if args.fresh {
        SessionStart::Fresh
    } else {
        SessionStart::Resumed
    };
    let session = ChatSession::connect(&settings, user, &args.token, mode).await?;

    match args.command {
        Command::History { peer } => open_and_print(&session, channel_for(peer)?).await,
        Command::Send { peer, message } => {
            let channel = channel_for(peer)?;
            let mut events = session.store().subscribe();
            match session.send(channel, &message.join(" ")).await? {
                SendOutcome::Stored(message) => print_message(&message),
                SendOutcome::Emitted => {
                    // The live path only confirms through the server's echo.
                    let own_id = session.user().id;
                    let echo = tokio::time::timeout(settings.request_timeout, async {
                        while let Ok(event) = events.recv().await {
                            if let Some(message) = own_echo(event, channel, own_id) {
                                return Some(message);
                            }
                        }
                        None
                    })
                    .await;
                    match echo {
                        Ok(Some(message)) => print_message(&message),
                        _ => println!("sent over the live channel; no confirmation received yet"),
                    }
                }
            }
        }
        Command::Follow { peer } => {
            let channel = channel_for(peer)?;
            let mut events = session.store().subscribe();
            open_and_print(&session, channel).await;
            let mut skipped = session.skipped_live_events();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(StoreEvent::MessageAppended { channel: c, message }) if c == channel => {
                            print_message(&message);
                            if session.skipped_live_events() != skipped {
                                skipped = session.skipped_live_events();
                                warn!(skipped, "live delivery fell behind, refetching");
                                open_and_print(&session, channel).await;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "display fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            session.close_conversation();
        }
        Command::Contacts => {
            for contact in session.contacts().await? {
                println!("{:>6}  {} ({:?})", contact.id.0, contact.display_name(), contact.role);
            }
        }
        Command::Unread => {
            println!("public: {}", session.unread(ChannelKey::Public));
            for peer_id in session.store().private_peers() {
                println!("{peer_id}: {}", session.unread(ChannelKey::private(peer_id)));
            }
            println!("total: {}", session.total_unread());
        }
        Command::Logout => {
            session.logout().await;
            println!("logged out");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::domain::MessageId;

    use super::*;

    fn message(id: i64, sender: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            sender_id: UserId(sender),
            sender: UserProfile {
                id: UserId(sender),
                username: format!("user{sender}"),
                role: Role::default(),
                first_name: None,
                last_name: None,
            },
            body: "hola".to_string(),
            timestamp: Utc::now(),
            recipient_id: None,
            recipient: None,
            is_private: false,
        }
    }

    fn appended(channel: ChannelKey, message: ChatMessage) -> StoreEvent {
        StoreEvent::MessageAppended { channel, message }
    }

    #[test]
    fn echo_wait_ignores_other_senders() {
        let me = UserId(1);
        let public = ChannelKey::Public;

        assert!(own_echo(appended(public, message(5, 2)), public, me).is_none());
        assert!(own_echo(appended(ChannelKey::private(UserId(2)), message(6, 1)), public, me)
            .is_none());
        assert_eq!(
            own_echo(appended(public, message(7, 1)), public, me).map(|m| m.id),
            Some(MessageId(7))
        );
    }
}

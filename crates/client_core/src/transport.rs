//! Request/response and live-delivery transports.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::ChannelKey,
    error::ApiError,
    protocol::{
        ChatMessage, LiveEmit, LiveEvent, LiveFrame, SendPrivateMessageRequest,
        SendPublicMessageRequest, UserProfile,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::LiveError;

/// Authoritative history and request-based sends.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(&self, channel: ChannelKey) -> Result<Vec<ChatMessage>>;
    async fn send(&self, channel: ChannelKey, body: &str) -> Result<ChatMessage>;
    async fn contacts(&self) -> Result<Vec<UserProfile>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// `epoch` grows by one on every successful (re)connect.
    Connected { epoch: u64 },
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }

    pub fn epoch(self) -> Option<u64> {
        match self {
            ConnectionStatus::Connected { epoch } => Some(epoch),
            ConnectionStatus::Disconnected => None,
        }
    }
}

/// Push-based delivery channel.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    /// Opens the channel if it is not already open.
    async fn connect(&self) -> Result<()>;
    fn disconnect(&self);
    fn status(&self) -> ConnectionStatus;
    fn watch_status(&self) -> watch::Receiver<ConnectionStatus>;
    /// Incoming events of every connection this value makes, including
    /// reconnects after the receiver was created.
    fn subscribe(&self) -> broadcast::Receiver<LiveEvent>;
    /// Queues an outbound event. Fails at once when no connection is open.
    fn emit(&self, emit: LiveEmit) -> std::result::Result<(), LiveError>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(server_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("token", &self.token)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(&self, channel: ChannelKey) -> Result<Vec<ChatMessage>> {
        let path = match channel {
            ChannelKey::Public => "/api/chat/messages".to_string(),
            ChannelKey::Private { peer_id } => format!("/api/chat/private/{}", peer_id.0),
        };
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .with_context(|| format!("history request for {channel} failed"))?;
        read_json(response).await
    }

    async fn send(&self, channel: ChannelKey, body: &str) -> Result<ChatMessage> {
        let request = match channel {
            ChannelKey::Public => self
                .request(Method::POST, "/api/chat/messages")
                .json(&SendPublicMessageRequest {
                    message: body.to_string(),
                }),
            ChannelKey::Private { peer_id } => self
                .request(Method::POST, "/api/chat/private")
                .json(&SendPrivateMessageRequest {
                    message: body.to_string(),
                    recipient_id: peer_id,
                }),
        };
        let response = request
            .send()
            .await
            .with_context(|| format!("send request for {channel} failed"))?;
        read_json(response).await
    }

    async fn contacts(&self) -> Result<Vec<UserProfile>> {
        let response = self
            .request(Method::GET, "/users")
            .send()
            .await
            .context("contacts request failed")?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let fallback = status.canonical_reason().unwrap_or("request failed");
        return Err(ApiError::from_body(status.as_u16(), &body, fallback).into());
    }
    let url = response.url().to_string();
    response
        .json()
        .await
        .with_context(|| format!("invalid response body from {url}"))
}

/// Turns the http(s) server url into the ws(s) endpoint of the live channel.
pub fn live_endpoint(server_url: &str, live_path: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url '{server_url}'"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(anyhow!("server_url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot derive {scheme} url from '{server_url}'"))?;
    url.set_path(live_path);
    url.set_query(None);
    Ok(url)
}

struct Outbound {
    epoch: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// [`LiveConnection`] over a WebSocket carrying `{"event", "data"}` frames.
pub struct WsLiveConnection {
    endpoint: Url,
    token: String,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: broadcast::Sender<LiveEvent>,
    epoch: AtomicU64,
    outbound: Mutex<Option<Outbound>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl WsLiveConnection {
    pub fn new(endpoint: Url, token: impl Into<String>, event_buffer: usize) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            endpoint,
            token: token.into(),
            status: Arc::new(status),
            events,
            epoch: AtomicU64::new(0),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_tasks(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl LiveConnection for WsLiveConnection {
    async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.status().is_connected() {
            return Ok(());
        }

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("token", &self.token);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        self.stop_tasks();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.lock_outbound() = Some(Outbound { epoch, tx });
        self.status.send_replace(ConnectionStatus::Connected { epoch });
        info!(epoch, endpoint = %self.endpoint, "live: connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = ws_writer.send(message).await {
                    warn!(epoch, "live: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let events = self.events.clone();
        let status = Arc::clone(&self.status);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<LiveFrame>(&text) {
                        Ok(frame) => {
                            let name = frame.event.clone();
                            match LiveEvent::from_frame(frame) {
                                Some(event) => {
                                    let _ = events.send(event);
                                }
                                None => debug!(epoch, event = %name, "live: ignoring unknown event"),
                            }
                        }
                        Err(err) => warn!(epoch, "live: invalid frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(epoch, "live: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let dropped = status.send_if_modified(|current| {
                if *current == (ConnectionStatus::Connected { epoch }) {
                    *current = ConnectionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
            if dropped {
                info!(epoch, "live: connection closed");
            }
        });

        self.lock_tasks().extend([writer, reader]);
        Ok(())
    }

    fn disconnect(&self) {
        self.lock_outbound().take();
        self.stop_tasks();
        if self.status.send_replace(ConnectionStatus::Disconnected).is_connected() {
            info!("live: disconnected");
        }
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
        let frame =
            serde_json::to_string(&emit).map_err(|err| LiveError::Encode(err.to_string()))?;
        let status = self.status();
        let outbound = self.lock_outbound();
        let Some(outbound) = outbound.as_ref() else {
            return Err(LiveError::NotConnected);
        };
        if status.epoch() != Some(outbound.epoch) {
            return Err(LiveError::NotConnected);
        }
        outbound
            .tx
            .send(Message::Text(frame))
            .map_err(|_| LiveError::Closed)
    }
}

impl Drop for WsLiveConnection {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::bus::EnvelopeSink;
use crate::config::KickSettings;
use crate::platforms::{AdapterContext, ConnectionTask, PlatformConnection, ReconnectTrigger};
use crate::types::{ChatEnvelope, Platform};

/// Event name used by the plain chat feed
const CHAT_MESSAGE_EVENT: &str = "chat_message";
/// Event name Kick publishes on its Pusher chatroom channel
const PUSHER_CHAT_EVENT: &str = "App\\Events\\ChatMessageEvent";

#[derive(Debug, Deserialize)]
struct KickChannelResponse {
    chatroom: KickChatroom,
}

#[derive(Debug, Deserialize)]
struct KickChatroom {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct KickChatData {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message: Option<String>,
    sender: KickSender,
}

#[derive(Debug, Deserialize)]
struct KickSender {
    username: String,
}

/// How a Kick socket session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// We were told to disconnect
    Shutdown,
    /// The socket closed on its own
    Closed,
}

/// Kick chat over the Pusher socket.
///
/// When the socket closes without a teardown, the whole orchestration pass is rerun
/// after `reconnect_delay`, rebuilding every platform, not just Kick.
pub struct KickConnection {
    settings: KickSettings,
    http_client: reqwest::Client,
    context: AdapterContext,
    channel: Option<String>,
    task: Option<ConnectionTask>,
    is_connected: Arc<RwLock<bool>>,
}

impl KickConnection {
    pub fn new(
        settings: KickSettings,
        http_client: reqwest::Client,
        context: AdapterContext,
    ) -> Self {
        Self {
            settings,
            http_client,
            context,
            channel: None,
            task: None,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }
}

/// Parse one socket text frame.
/// Anything other than a well-formed chat message yields `None`.
pub fn parse_kick_frame(raw: &str) -> Option<ChatEnvelope> {
    let frame: Value = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping unparseable Kick frame: {}", e);
            return None;
        }
    };

    let event = frame.get("event")?.as_str()?;
    if event != CHAT_MESSAGE_EVENT && event != PUSHER_CHAT_EVENT {
        return None;
    }

    // Pusher double-encodes: `data` is itself a JSON string
    let data = match frame.get("data")? {
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(data) => data,
            Err(e) => {
                debug!("Dropping Kick frame with unparseable data: {}", e);
                return None;
            }
        },
        data => data.clone(),
    };

    parse_chat_data(data)
}

/// Normalize a chat payload, as delivered by either the socket or a chat event
pub fn parse_chat_data(data: Value) -> Option<ChatEnvelope> {
    let chat: KickChatData = match serde_json::from_value(data) {
        Ok(chat) => chat,
        Err(e) => {
            debug!("Dropping Kick chat payload with unexpected shape: {}", e);
            return None;
        }
    };

    let message = chat.content.or(chat.message)?;
    Some(ChatEnvelope::with_default_color(
        Platform::Kick,
        chat.sender.username,
        message,
    ))
}

fn subscribe_frame(chatroom_id: u64) -> String {
    json!({
        "event": "pusher:subscribe",
        "data": { "auth": "", "channel": format!("chatrooms.{}.v2", chatroom_id) }
    })
    .to_string()
}

fn is_pusher_ping(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|frame| {
            frame
                .get("event")
                .and_then(Value::as_str)
                .map(|e| e == "pusher:ping")
        })
        .unwrap_or(false)
}

async fn resolve_chatroom_id(
    http_client: &reqwest::Client,
    api_base_url: &str,
    slug: &str,
) -> Result<u64> {
    let url = format!(
        "{}/channels/{}",
        api_base_url.trim_end_matches('/'),
        urlencoding::encode(slug)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/json")
        .header("User-Agent", concat!("multichat/", env!("CARGO_PKG_VERSION")))
        .send()
        .await
        .context("Failed to look up Kick channel")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Kick channel lookup for '{}' failed: {}",
            slug,
            response.status()
        ));
    }

    let channel: KickChannelResponse = response
        .json()
        .await
        .context("Failed to parse Kick channel response")?;
    Ok(channel.chatroom.id)
}

/// Connect and pump frames until shutdown or close. Errors mean the socket never opened.
async fn run_session(
    settings: &KickSettings,
    http_client: &reqwest::Client,
    slug: &str,
    sink: &EnvelopeSink,
    is_connected: &RwLock<bool>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Result<SessionEnd> {
    let chatroom_id = resolve_chatroom_id(http_client, &settings.api_base_url, slug).await?;
    debug!("Kick channel '{}' uses chatroom {}", slug, chatroom_id);

    let url = Url::parse(&settings.pusher_url).context("Failed to parse Kick Pusher URL")?;
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Kick WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(subscribe_frame(chatroom_id)))
        .await
        .context("Failed to subscribe to Kick chatroom")?;

    *is_connected.write().await = true;
    info!("Subscribed to Kick chatroom for '{}'", slug);

    let end = loop {
        tokio::select! {
            _ = &mut *shutdown => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("Kick close frame not sent: {}", e);
                }
                break SessionEnd::Shutdown;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if is_pusher_ping(&text) {
                        let pong = json!({ "event": "pusher:pong", "data": {} }).to_string();
                        if let Err(e) = write.send(Message::Text(pong)).await {
                            error!("Failed to answer Kick ping: {}", e);
                        }
                        continue;
                    }

                    if let Some(envelope) = parse_kick_frame(&text) {
                        debug!("Kick message from {}: {}", envelope.user(), envelope.message());
                        sink.emit(envelope);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    warn!("Kick connection closed: {:?}", close_frame);
                    break SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Kick WebSocket error: {}", e);
                    break SessionEnd::Closed;
                }
                None => {
                    warn!("Kick WebSocket stream ended");
                    break SessionEnd::Closed;
                }
            }
        }
    };

    *is_connected.write().await = false;
    Ok(end)
}

/// Wait out the delay, then ask for a full reconnect unless torn down meanwhile
async fn schedule_restart(
    trigger: &ReconnectTrigger,
    sink: &EnvelopeSink,
    delay: std::time::Duration,
    shutdown: &mut oneshot::Receiver<()>,
) {
    info!("Kick socket closed, rebuilding all platforms in {:?}", delay);
    tokio::select! {
        _ = &mut *shutdown => {
            debug!("Kick restart cancelled by teardown");
        }
        _ = sleep(delay) => {
            if !sink.is_current() {
                debug!("Kick restart skipped, generation {} superseded", trigger.generation());
            } else if !trigger.fire() {
                warn!("Kick restart requested but the orchestrator is gone");
            }
        }
    }
}

#[async_trait]
impl PlatformConnection for KickConnection {
    async fn connect(&mut self, identifier: &str) -> Result<()> {
        info!("Connecting to Kick chat for '{}'...", identifier);
        self.channel = Some(identifier.to_string());

        let slug = identifier.to_string();
        let settings = self.settings.clone();
        let http_client = self.http_client.clone();
        let sink = self.context.sink.clone();
        let trigger = self.context.reconnect.clone();
        let is_connected = Arc::clone(&self.is_connected);

        self.task = Some(ConnectionTask::spawn(move |mut shutdown| async move {
            let result = run_session(
                &settings,
                &http_client,
                &slug,
                &sink,
                &is_connected,
                &mut shutdown,
            )
            .await;
            *is_connected.write().await = false;

            match result {
                Ok(SessionEnd::Shutdown) => debug!("Kick reader for '{}' stopped", slug),
                Ok(SessionEnd::Closed) => {
                    let delay = settings.reconnect_delay();
                    schedule_restart(&trigger, &sink, delay, &mut shutdown).await;
                }
                Err(e) => error!("Kick connection for '{}' failed: {:#}", slug, e),
            }
        }));

        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Kick
    }

    fn identifier(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.stop();
            info!(
                "Disconnected from Kick '{}'",
                self.channel.as_deref().unwrap_or_default()
            );
        }
        *self.is_connected.write().await = false;
        Ok(())
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::bus::EnvelopeSink;
use crate::config::TikTokSettings;
use crate::platforms::{AdapterContext, ConnectionTask, PlatformConnection};
use crate::types::{ChatEnvelope, Platform};

/// Gift type TikTok uses for gifts that can be sent in a streak
const STREAKABLE_GIFT_TYPE: u64 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TikTokChat {
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    comment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TikTokGift {
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    gift_name: String,
    #[serde(default)]
    repeat_count: Option<u64>,
    #[serde(default)]
    gift_type: Option<u64>,
    #[serde(default)]
    repeat_end: Option<bool>,
}

/// TikTok LIVE chat through a room-event relay.
///
/// The relay joins the room on our behalf and streams chat and gift events as JSON
/// frames of the form `{"event": "chat" | "gift" | ..., "data": {...}}`.
pub struct TikTokConnection {
    settings: TikTokSettings,
    context: AdapterContext,
    username: Option<String>,
    task: Option<ConnectionTask>,
    is_connected: Arc<RwLock<bool>>,
}

impl TikTokConnection {
    pub fn new(settings: TikTokSettings, context: AdapterContext) -> Self {
        Self {
            settings,
            context,
            username: None,
            task: None,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }
}

fn display_name(nickname: Option<String>, unique_id: Option<String>) -> String {
    nickname
        .filter(|n| !n.trim().is_empty())
        .or(unique_id)
        .unwrap_or_else(|| "TikToker".to_string())
}

/// Parse one relay frame.
/// Chat and finished gifts produce an envelope; anything else is dropped.
pub fn parse_tiktok_frame(raw: &str) -> Option<ChatEnvelope> {
    let frame: Value = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping unparseable TikTok frame: {}", e);
            return None;
        }
    };

    let event = frame.get("event")?.as_str()?;
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    match event {
        "chat" => {
            let chat: TikTokChat = serde_json::from_value(data)
                .map_err(|e| debug!("Dropping TikTok chat with unexpected shape: {}", e))
                .ok()?;
            Some(ChatEnvelope::with_default_color(
                Platform::TikTok,
                display_name(chat.nickname, chat.unique_id),
                chat.comment,
            ))
        }
        "gift" => {
            let gift: TikTokGift = serde_json::from_value(data)
                .map_err(|e| debug!("Dropping TikTok gift with unexpected shape: {}", e))
                .ok()?;

            // Streak gifts repeat until the streak ends; only the final count is shown
            if gift.gift_type == Some(STREAKABLE_GIFT_TYPE) && gift.repeat_end == Some(false) {
                return None;
            }

            let count = gift.repeat_count.unwrap_or(1).max(1);
            Some(ChatEnvelope::with_default_color(
                Platform::TikTok,
                display_name(gift.nickname, gift.unique_id),
                format!("🎁 {} ×{}", gift.gift_name, count),
            ))
        }
        "roomJoined" | "connected" => {
            info!("TikTok relay joined the room");
            None
        }
        "streamEnd" | "disconnected" => {
            info!("TikTok relay reports the stream ended");
            None
        }
        other => {
            debug!("Ignoring TikTok event '{}'", other);
            None
        }
    }
}

fn relay_url(base: &str, username: &str) -> Result<Url> {
    let mut url = Url::parse(base).context("Failed to parse TikTok relay URL")?;
    url.query_pairs_mut().append_pair("uniqueId", username);
    Ok(url)
}

async fn run_session(
    url: Url,
    username: String,
    sink: EnvelopeSink,
    is_connected: Arc<RwLock<bool>>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to TikTok relay")?;
    let (mut write, mut read) = ws_stream.split();

    *is_connected.write().await = true;
    info!("Joining TikTok room of @{}", username);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("TikTok close frame not sent: {}", e);
                }
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(envelope) = parse_tiktok_frame(&text) {
                        debug!("TikTok message from {}: {}", envelope.user(), envelope.message());
                        sink.emit(envelope);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("TikTok relay closed: {:?}", close_frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("TikTok relay error: {}", e);
                    break;
                }
                None => {
                    warn!("TikTok relay stream ended");
                    break;
                }
            }
        }
    }

    *is_connected.write().await = false;
    Ok(())
}

#[async_trait]
impl PlatformConnection for TikTokConnection {
    async fn connect(&mut self, identifier: &str) -> Result<()> {
        let username = identifier.trim_start_matches('@').to_string();
        let url = relay_url(&self.settings.relay_url, &username)?;

        info!("Connecting to TikTok LIVE for @{}...", username);
        self.username = Some(username.clone());

        let sink = self.context.sink.clone();
        let is_connected = Arc::clone(&self.is_connected);
        self.task = Some(ConnectionTask::spawn(move |shutdown| async move {
            let result =
                run_session(url, username.clone(), sink, is_connected.clone(), shutdown).await;
            if let Err(e) = result {
                error!("TikTok connection for @{} failed: {:#}", username, e);
            }
            *is_connected.write().await = false;
        }));

        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    fn identifier(&self) -> Option<&str> {
        self.username.as_deref()
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.stop();
            info!(
                "Disconnected from TikTok @{}",
                self.username.as_deref().unwrap_or_default()
            );
        }
        *self.is_connected.write().await = false;
        Ok(())
    }
}

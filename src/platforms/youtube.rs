use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use url::Url;

use crate::bus::EnvelopeSink;
use crate::config::YouTubeSettings;
use crate::platforms::poller::RepeatingTask;
use crate::platforms::{AdapterContext, PlatformConnection};
use crate::types::{ChatEnvelope, Platform};

/// Author shown when a message carries no display name
const FALLBACK_AUTHOR: &str = "YouTuber";

/// YouTube live chat, polled on a fixed interval since there is no push API
pub struct YouTubeConnection {
    settings: YouTubeSettings,
    http_client: reqwest::Client,
    context: AdapterContext,
    live_chat_id: Option<String>,
    poller: Option<RepeatingTask>,
    is_connected: Arc<RwLock<bool>>,
}

impl YouTubeConnection {
    pub fn new(
        settings: YouTubeSettings,
        http_client: reqwest::Client,
        context: AdapterContext,
    ) -> Self {
        Self {
            settings,
            http_client,
            context,
            live_chat_id: None,
            poller: None,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }
}

/// Extract every text message from one live chat response.
///
/// Accepts both the array form (`[_, {"response": ...}]`) and a bare
/// `{"response": ...}` object. Unknown shapes yield no envelopes.
pub fn parse_live_chat_actions(json: &Value) -> Vec<ChatEnvelope> {
    let response = json
        .get(1)
        .and_then(|entry| entry.get("response"))
        .or_else(|| json.get("response"));

    let actions = match response
        .and_then(|r| r.pointer("/continuationContents/liveChatContinuation/actions"))
        .and_then(Value::as_array)
    {
        Some(actions) => actions,
        None => {
            debug!("YouTube response carries no chat actions");
            return Vec::new();
        }
    };

    actions
        .iter()
        .filter_map(|action| {
            action.pointer("/addChatItemAction/item/liveChatTextMessageRenderer")
        })
        .map(text_message_envelope)
        .collect()
}

fn text_message_envelope(renderer: &Value) -> ChatEnvelope {
    let author = renderer
        .pointer("/authorName/simpleText")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_AUTHOR);

    let message: String = renderer
        .pointer("/message/runs")
        .and_then(Value::as_array)
        .map(|runs| runs.iter().map(run_text).collect())
        .unwrap_or_default();

    ChatEnvelope::with_default_color(Platform::YouTube, author, message)
}

/// A run contributes its text, or the emoji id for emoji runs
fn run_text(run: &Value) -> &str {
    run.get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .or_else(|| run.pointer("/emoji/emojiId").and_then(Value::as_str))
        .unwrap_or("")
}

fn live_chat_url(settings: &YouTubeSettings, live_chat_id: &str) -> Result<Url> {
    let mut url =
        Url::parse(&settings.live_chat_url).context("Failed to parse YouTube live chat URL")?;
    url.query_pairs_mut()
        .append_pair("v", live_chat_id)
        .append_pair("pbj", "1");
    Ok(url)
}

async fn fetch_live_chat(
    http_client: &reqwest::Client,
    url: &Url,
    client_version: &str,
) -> Result<Value> {
    let response = http_client
        .get(url.clone())
        .header("x-youtube-client-version", client_version)
        .send()
        .await
        .context("Failed to poll YouTube live chat")?;

    if !response.status().is_success() {
        return Err(anyhow!("YouTube live chat returned {}", response.status()));
    }

    response
        .json()
        .await
        .context("Failed to parse YouTube live chat response")
}

/// One poll: fetch, parse, emit. Returns how many envelopes were emitted.
/// Gives up after `request_timeout`.
async fn poll_once(
    http_client: &reqwest::Client,
    url: &Url,
    client_version: &str,
    request_timeout: Duration,
    sink: &EnvelopeSink,
) -> Result<usize> {
    let json = timeout(request_timeout, fetch_live_chat(http_client, url, client_version))
        .await
        .map_err(|_| anyhow!("YouTube live chat did not answer within {:?}", request_timeout))??;

    let envelopes = parse_live_chat_actions(&json);
    let count = envelopes.len();
    for envelope in envelopes {
        sink.emit(envelope);
    }
    Ok(count)
}

#[async_trait]
impl PlatformConnection for YouTubeConnection {
    async fn connect(&mut self, identifier: &str) -> Result<()> {
        // Arm at most one timer per adapter
        if let Some(previous) = self.poller.take() {
            previous.cancel();
        }

        let live_chat_id = identifier.to_string();
        let url = live_chat_url(&self.settings, &live_chat_id)?;
        let poll_interval = self.settings.poll_interval();
        info!("Polling YouTube live chat for '{}' every {:?}", live_chat_id, poll_interval);

        let http_client = self.http_client.clone();
        let client_version = self.settings.client_version.clone();
        let request_timeout = self.settings.request_timeout();
        let sink = self.context.sink.clone();
        let chat_id = live_chat_id.clone();

        self.poller = Some(RepeatingTask::spawn(
            format!("youtube:{}", live_chat_id),
            poll_interval,
            move || {
                let http_client = http_client.clone();
                let url = url.clone();
                let client_version = client_version.clone();
                let sink = sink.clone();
                let chat_id = chat_id.clone();
                async move {
                    let polled =
                        poll_once(&http_client, &url, &client_version, request_timeout, &sink)
                            .await;
                    match polled {
                        Ok(count) => debug!("Polled {} YouTube messages for '{}'", count, chat_id),
                        Err(e) => error!("YouTube fetch error for '{}': {:#}", chat_id, e),
                    }
                }
            },
        ));

        self.live_chat_id = Some(live_chat_id);
        *self.is_connected.write().await = true;
        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    fn identifier(&self) -> Option<&str> {
        self.live_chat_id.as_deref()
    }

    async fn is_connected(&self) -> bool {
        let armed = self.poller.as_ref().map(RepeatingTask::is_armed).unwrap_or(false);
        armed && *self.is_connected.read().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.cancel();
            info!(
                "Stopped polling YouTube '{}'",
                self.live_chat_id.as_deref().unwrap_or_default()
            );
        }
        *self.is_connected.write().await = false;
        Ok(())
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::bus::EnvelopeSink;
use crate::config::TwitchSettings;
use crate::platforms::{AdapterContext, ConnectionTask, PlatformConnection};
use crate::types::{ChatEnvelope, Platform};

/// Read-only Twitch IRC connection using an anonymous `justinfan` login
pub struct TwitchConnection {
    settings: TwitchSettings,
    context: AdapterContext,
    channel: Option<String>,
    task: Option<ConnectionTask>,
    is_connected: Arc<RwLock<bool>>,
}

impl TwitchConnection {
    pub fn new(settings: TwitchSettings, context: AdapterContext) -> Self {
        Self {
            settings,
            context,
            channel: None,
            task: None,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }
}

/// Parse every PRIVMSG in a websocket frame. Twitch may batch several lines per frame.
pub fn parse_twitch_frame(raw: &str) -> Vec<ChatEnvelope> {
    raw.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(parse_privmsg)
        .collect()
}

/// Parse one IRC line into an envelope.
///
/// Format:
/// `@color=#FF0000;display-name=Foo :foo!foo@foo.tmi.twitch.tv PRIVMSG #channel :message`
pub fn parse_privmsg(line: &str) -> Option<ChatEnvelope> {
    let line = line.trim_end_matches(['\r', '\n']);

    let (tags, rest) = match line.strip_prefix('@') {
        Some(tagged) => {
            let (tags, rest) = tagged.split_once(' ')?;
            (Some(tags), rest)
        }
        None => (None, line),
    };

    let (prefix, command_and_params) = rest.strip_prefix(':')?.split_once(' ')?;
    let (command, params) = command_and_params.split_once(' ')?;
    if command != "PRIVMSG" {
        return None;
    }

    let (_channel, message) = params.split_once(" :")?;
    let login = prefix.split('!').next().unwrap_or_default();

    let mut display_name = None;
    let mut color = None;
    for tag in tags.into_iter().flat_map(|t| t.split(';')) {
        match tag.split_once('=') {
            Some(("display-name", value)) if !value.is_empty() => {
                display_name = Some(unescape_tag_value(value));
            }
            Some(("color", value)) if !value.is_empty() => color = Some(value.to_string()),
            _ => {}
        }
    }

    let user = display_name.unwrap_or_else(|| login.to_string());
    if user.is_empty() {
        debug!("PRIVMSG without a user: {}", line);
        return None;
    }

    // /me messages arrive wrapped in CTCP ACTION
    let message = message
        .strip_prefix("\u{1}ACTION ")
        .and_then(|m| m.strip_suffix('\u{1}'))
        .unwrap_or(message);

    Some(ChatEnvelope::new(
        Platform::Twitch,
        user,
        message,
        color.unwrap_or_else(|| Platform::Twitch.default_color().to_string()),
    ))
}

fn unescape_tag_value(value: &str) -> String {
    value.replace("\\s", " ").replace("\\\\", "\\")
}

fn anonymous_nick() -> String {
    format!("justinfan{}", rand::random_range(10_000..99_999))
}

async fn run_session(
    url: Url,
    channel: String,
    sink: EnvelopeSink,
    is_connected: Arc<RwLock<bool>>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Twitch WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text("CAP REQ :twitch.tv/tags twitch.tv/commands\r\n".to_string()))
        .await
        .context("Failed to request capabilities")?;
    write
        .send(Message::Text("PASS SCHMOOPIIE\r\n".to_string()))
        .await
        .context("Failed to send PASS command")?;
    write
        .send(Message::Text(format!("NICK {}\r\n", anonymous_nick())))
        .await
        .context("Failed to send NICK command")?;
    write
        .send(Message::Text(format!("JOIN #{}\r\n", channel)))
        .await
        .with_context(|| format!("Failed to join channel: {}", channel))?;

    *is_connected.write().await = true;
    info!("Joined Twitch channel #{}", channel);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("Twitch close frame not sent: {}", e);
                }
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if text.starts_with("PING") {
                        debug!("Responding to PING");
                        let pong = text.replacen("PING", "PONG", 1);
                        if let Err(e) = write.send(Message::Text(pong)).await {
                            error!("Failed to send PONG: {}", e);
                        }
                        continue;
                    }

                    for envelope in parse_twitch_frame(&text) {
                        debug!("Twitch message from {}: {}", envelope.user(), envelope.message());
                        sink.emit(envelope);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("Twitch connection closed: {:?}", close_frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Twitch WebSocket error: {}", e);
                    break;
                }
                None => {
                    warn!("Twitch WebSocket stream ended");
                    break;
                }
            }
        }
    }

    *is_connected.write().await = false;
    Ok(())
}

#[async_trait]
impl PlatformConnection for TwitchConnection {
    async fn connect(&mut self, identifier: &str) -> Result<()> {
        let channel = identifier.to_lowercase();
        let url = Url::parse(&self.settings.websocket_url)
            .context("Failed to parse Twitch WebSocket URL")?;

        info!("Connecting to Twitch chat for #{}...", channel);
        self.channel = Some(channel.clone());

        let sink = self.context.sink.clone();
        let is_connected = Arc::clone(&self.is_connected);
        self.task = Some(ConnectionTask::spawn(move |shutdown| async move {
            let result =
                run_session(url, channel.clone(), sink, is_connected.clone(), shutdown).await;
            if let Err(e) = result {
                error!("Twitch connection for #{} failed: {:#}", channel, e);
            }
            *is_connected.write().await = false;
            debug!("Twitch reader for #{} exited", channel);
        }));

        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Twitch
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
                "Disconnected from Twitch #{}",
                self.channel.as_deref().unwrap_or_default()
            );
        }
        *self.is_connected.write().await = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::platforms::ReconnectTrigger;
    use crate::types::PlatformRequest;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[test]
    fn test_privmsg_with_tags() {
        let line = concat!(
            "@badge-info=;badges=moderator/1;color=#1E90FF;display-name=CoolDude;mod=1 ",
            ":cooldude!cooldude@cooldude.tmi.twitch.tv PRIVMSG #shroud :hello chat"
        );
        let envelope = parse_privmsg(line).unwrap();

        assert_eq!(envelope.platform(), Platform::Twitch);
        assert_eq!(envelope.user(), "CoolDude");
        assert_eq!(envelope.message(), "hello chat");
        assert_eq!(envelope.color(), "#1E90FF");
    }

    #[test]
    fn test_missing_display_name_and_color_fall_back() {
        let line = "@color=;display-name= :lurker!lurker@lurker.tmi.twitch.tv PRIVMSG #shroud :hi";
        let envelope = parse_privmsg(line).unwrap();

        assert_eq!(envelope.user(), "lurker");
        assert_eq!(envelope.color(), "#9146FF");
    }

    #[test]
    fn test_untagged_privmsg() {
        let line = ":lurker!lurker@lurker.tmi.twitch.tv PRIVMSG #shroud :no tags here: still text";
        let envelope = parse_privmsg(line).unwrap();

        assert_eq!(envelope.user(), "lurker");
        assert_eq!(envelope.message(), "no tags here: still text");
    }

    #[test]
    fn test_action_message_is_unwrapped() {
        let line = ":dancer!dancer@dancer.tmi.twitch.tv PRIVMSG #shroud :\u{1}ACTION dances\u{1}";
        assert_eq!(parse_privmsg(line).unwrap().message(), "dances");
    }

    #[test]
    fn test_non_privmsg_lines_are_ignored() {
        assert!(parse_privmsg(":tmi.twitch.tv 001 justinfan12345 :Welcome, GLHF!").is_none());
        assert!(parse_privmsg("PING :tmi.twitch.tv").is_none());
        assert!(parse_privmsg("@msg-id=sub :tmi.twitch.tv USERNOTICE #shroud :x").is_none());
    }

    #[test]
    fn test_frame_with_several_lines() {
        let frame = concat!(
            ":a!a@a.tmi.twitch.tv PRIVMSG #c :one\r\n",
            ":tmi.twitch.tv PONG\r\n",
            ":b!b@b.tmi.twitch.tv PRIVMSG #c :two\r\n"
        );
        let envelopes = parse_twitch_frame(frame);

        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].message(), "one");
        assert_eq!(envelopes[1].user(), "b");
    }

    #[test]
    fn test_escaped_display_name() {
        let line = "@display-name=Two\\sWords :two!two@two.tmi.twitch.tv PRIVMSG #c :hey";
        assert_eq!(parse_privmsg(line).unwrap().user(), "Two Words");
    }

    #[test]
    fn test_anonymous_nick_shape() {
        let nick = anonymous_nick();
        assert!(nick.starts_with("justinfan"));
        assert!(nick["justinfan".len()..].parse::<u32>().is_ok());
    }

    #[tokio::test]
    async fn test_socket_loop_answers_ping_and_emits_privmsg() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        // Fake IRC server: read the login, ping once, deliver one message
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let mut login = Vec::new();
            for _ in 0..4 {
                login.push(ws.next().await.unwrap().unwrap().into_text().unwrap());
            }
            ws.send(Message::Text("PING :tmi.twitch.tv\r\n".to_string()))
                .await
                .unwrap();
            let pong = ws.next().await.unwrap().unwrap().into_text().unwrap();

            let privmsg = concat!(
                "@color=#FF4500;display-name=Viewer ",
                ":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #shroud :hello\r\n"
            );
            ws.send(Message::Text(privmsg.to_string())).await.unwrap();

            let closed = matches!(ws.next().await, Some(Ok(Message::Close(_))));
            let _ = seen_tx.send((login, pong, closed));
        });

        let bus = EventBus::new(8);
        let mut viewer = bus.subscribe();
        let generation = bus.advance_generation();
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = AdapterContext {
            sink: bus.sink(generation),
            reconnect: ReconnectTrigger::new(tx, generation, PlatformRequest::default()),
        };
        let settings = TwitchSettings {
            websocket_url: format!("ws://{}", address),
        };

        let mut connection = TwitchConnection::new(settings, context);
        connection.connect("Shroud").await.unwrap();

        let envelope = timeout(Duration::from_secs(5), viewer.recv())
            .await
            .expect("privmsg should reach the bus")
            .unwrap();
        assert_eq!(
            envelope,
            ChatEnvelope::new(Platform::Twitch, "Viewer", "hello", "#FF4500")
        );
        assert!(connection.is_connected().await);

        connection.disconnect().await.unwrap();
        let (login, pong, closed) = timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(login[0], "CAP REQ :twitch.tv/tags twitch.tv/commands\r\n");
        assert_eq!(login[1], "PASS SCHMOOPIIE\r\n");
        assert!(login[2].starts_with("NICK justinfan"));
        assert_eq!(login[3], "JOIN #shroud\r\n");
        assert_eq!(pong, "PONG :tmi.twitch.tv\r\n");
        assert!(closed, "disconnect should send a close frame");
    }
}

// src/config/mod.rs - Aggregator configuration: TOML file plus environment overrides

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Top-level configuration for the chat aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub session: SessionSettings,
    pub twitch: TwitchSettings,
    pub kick: KickSettings,
    pub tiktok: TikTokSettings,
    pub youtube: YouTubeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    /// Directory holding the overlay page and its assets
    pub static_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            static_dir: PathBuf::from("public"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Envelopes buffered per viewer before a slow viewer starts skipping
    pub capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound on a single handle's disconnect during teardown
    pub teardown_timeout_ms: u64,
    /// Upper bound on any HTTP request an adapter makes (Kick lookup, YouTube poll)
    pub http_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            teardown_timeout_ms: 2000,
            http_timeout_ms: 5000,
        }
    }
}

impl SessionSettings {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchSettings {
    pub websocket_url: String,
}

impl Default for TwitchSettings {
    fn default() -> Self {
        Self {
            websocket_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KickSettings {
    /// Base URL of the public channel lookup API
    pub api_base_url: String,
    /// Pusher endpoint carrying chatroom events
    pub pusher_url: String,
    /// Delay before a closed Kick socket re-runs the whole orchestration pass
    pub reconnect_delay_secs: u64,
}

impl Default for KickSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://kick.com/api/v2".to_string(),
            pusher_url: concat!(
                "wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679",
                "?protocol=7&client=js&version=8.4.0-rc2&flash=false"
            )
            .to_string(),
            reconnect_delay_secs: 5,
        }
    }
}

impl KickSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TikTokSettings {
    /// Relay socket emitting room events as JSON.
    /// `uniqueId` is appended as a query parameter.
    pub relay_url: String,
}

impl Default for TikTokSettings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:21213/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeSettings {
    pub live_chat_url: String,
    /// Sent as `x-youtube-client-version`; the endpoint rejects requests without it
    pub client_version: String,
    pub poll_interval_secs: u64,
    /// Per-poll deadline, capped at the poll interval so hung polls never overlap
    pub request_timeout_ms: u64,
}

impl Default for YouTubeSettings {
    fn default() -> Self {
        Self {
            live_chat_url: "https://www.youtube.com/live_chat".to_string(),
            client_version: "2.20241120.01.00".to_string(),
            poll_interval_secs: 6,
            request_timeout_ms: 5000,
        }
    }
}

impl YouTubeSettings {
    /// Never shorter than one second
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1)).min(self.poll_interval())
    }
}

impl AggregatorConfig {
    /// Load configuration: defaults, then the optional TOML file, then environment
    /// overrides. The file path comes from `path` or `MULTICHAT_CONFIG`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("MULTICHAT_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file given, starting from defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing sections and keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = env_parsed::<u16>("PORT")? {
            self.server.port = port;
        }
        if let Ok(bind) = env::var("MULTICHAT_BIND") {
            self.server.bind_address = bind;
        }
        if let Ok(dir) = env::var("MULTICHAT_STATIC_DIR") {
            self.server.static_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parsed::<u64>("MULTICHAT_YOUTUBE_POLL_SECS")? {
            self.youtube.poll_interval_secs = secs;
        }
        if let Some(secs) = env_parsed::<u64>("MULTICHAT_KICK_RECONNECT_SECS")? {
            self.kick.reconnect_delay_secs = secs;
        }
        if let Some(ms) = env_parsed::<u64>("MULTICHAT_HTTP_TIMEOUT_MS")? {
            self.session.http_timeout_ms = ms;
        }
        if let Ok(relay) = env::var("MULTICHAT_TIKTOK_RELAY_URL") {
            self.tiktok.relay_url = relay;
        }
        Ok(())
    }

    /// Reject values the aggregator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.youtube.poll_interval_secs == 0 {
            return Err(invalid("youtube.poll_interval_secs", "must be at least 1 second"));
        }
        if self.bus.capacity == 0 {
            return Err(invalid("bus.capacity", "must be greater than zero"));
        }
        if self.session.http_timeout_ms == 0 {
            return Err(invalid("session.http_timeout_ms", "must be greater than zero"));
        }
        if self.youtube.request_timeout_ms == 0 {
            return Err(invalid("youtube.request_timeout_ms", "must be greater than zero"));
        }
        let poll_interval = self.youtube.poll_interval();
        if Duration::from_millis(self.youtube.request_timeout_ms) >= poll_interval {
            warn!(
                "youtube.request_timeout_ms ({}) is not below the poll interval, capped at {:?}",
                self.youtube.request_timeout_ms, poll_interval
            );
        }
        if self.kick.reconnect_delay_secs == 0 {
            warn!(
                "kick.reconnect_delay_secs is 0, a flapping Kick socket will rebuild \
                 every platform in a tight loop"
            );
        }

        for (key, value) in [
            ("twitch.websocket_url", &self.twitch.websocket_url),
            ("kick.api_base_url", &self.kick.api_base_url),
            ("kick.pusher_url", &self.kick.pusher_url),
            ("tiktok.relay_url", &self.tiktok.relay_url),
            ("youtube.live_chat_url", &self.youtube.live_chat_url),
        ] {
            Url::parse(value).map_err(|e| invalid(key, &e.to_string()))?;
        }

        Ok(())
    }

    /// Socket address string the overlay server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &e.to_string())),
        Err(_) => Ok(None),
    }
}

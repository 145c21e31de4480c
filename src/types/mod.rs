// src/types/mod.rs - Envelope and request types shared by every platform

use serde::{Deserialize, Serialize};
use std::fmt;

/// Streaming platforms the overlay can merge chat from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Kick,
    TikTok,
    YouTube,
}

impl Platform {
    /// Every platform, in the order slots are rebuilt during an orchestration pass
    pub const ALL: [Platform; 4] = [
        Platform::Twitch,
        Platform::Kick,
        Platform::TikTok,
        Platform::YouTube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Kick => "kick",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
        }
    }

    /// Color used when the platform supplies none of its own
    pub fn default_color(&self) -> &'static str {
        match self {
            Platform::Twitch => "#9146FF",
            Platform::Kick => "#00FF00",
            Platform::TikTok => "#FF0050",
            Platform::YouTube => "#FF0000",
        }
    }

    /// Prefix of identifiers that are already canonical channel ids
    fn channel_id_prefix(&self) -> Option<&'static str> {
        match self {
            Platform::YouTube => Some("UC"),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized chat message broadcast to every viewer.
///
/// Fields are private so an envelope cannot change after an adapter builds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    platform: Platform,
    user: String,
    message: String,
    color: String,
}

impl ChatEnvelope {
    pub fn new(
        platform: Platform,
        user: impl Into<String>,
        message: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            user: user.into(),
            message: message.into(),
            color: color.into(),
        }
    }

    /// Envelope carrying the platform's default color
    pub fn with_default_color(
        platform: Platform,
        user: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(platform, user, message, platform.default_color())
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn color(&self) -> &str {
        &self.color
    }
}

/// Identifiers a viewer asked for. Absent or blank means "leave that platform off".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRequest {
    #[serde(default)]
    pub twitch: Option<String>,
    #[serde(default)]
    pub youtube: Option<String>,
    #[serde(default)]
    pub kick: Option<String>,
    #[serde(default)]
    pub tiktok: Option<String>,
}

impl PlatformRequest {
    fn raw(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Twitch => self.twitch.as_deref(),
            Platform::Kick => self.kick.as_deref(),
            Platform::TikTok => self.tiktok.as_deref(),
            Platform::YouTube => self.youtube.as_deref(),
        }
    }

    /// Normalized identifier for `platform`, or `None` when it was not requested
    pub fn identifier(&self, platform: Platform) -> Option<String> {
        self.raw(platform)
            .and_then(|raw| normalize_identifier(platform, raw))
    }

    /// Platforms with a usable identifier in this request
    pub fn requested_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.identifier(*p).is_some())
            .collect()
    }
}

/// Trim an identifier and strip a leading `@` handle marker.
///
/// Canonical channel ids (YouTube `UC...`) pass through untouched. Twitch logins are
/// case-insensitive and come back lowercased. Blank input yields `None`.
pub fn normalize_identifier(platform: Platform, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(prefix) = platform.channel_id_prefix() {
        if trimmed.starts_with(prefix) {
            return Some(trimmed.to_string());
        }
    }

    let handle = trimmed.strip_prefix('@').unwrap_or(trimmed).trim();
    if handle.is_empty() {
        return None;
    }

    match platform {
        Platform::Twitch => Some(handle.to_lowercase()),
        _ => Some(handle.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_lose_their_at_sign() {
        assert_eq!(normalize_identifier(Platform::TikTok, "@alice").as_deref(), Some("alice"));
        assert_eq!(normalize_identifier(Platform::YouTube, "@alice").as_deref(), Some("alice"));
        assert_eq!(normalize_identifier(Platform::Kick, "  @xqc ").as_deref(), Some("xqc"));
    }

    #[test]
    fn test_youtube_channel_id_passes_through() {
        assert_eq!(normalize_identifier(Platform::YouTube, "UC123").as_deref(), Some("UC123"));
        assert_eq!(normalize_identifier(Platform::YouTube, " UC123 ").as_deref(), Some("UC123"));
    }

    #[test]
    fn test_twitch_login_is_lowercased() {
        assert_eq!(normalize_identifier(Platform::Twitch, "Shroud").as_deref(), Some("shroud"));
    }

    #[test]
    fn test_blank_identifiers_are_not_requested() {
        for platform in Platform::ALL {
            assert_eq!(normalize_identifier(platform, ""), None);
            assert_eq!(normalize_identifier(platform, "   \t"), None);
            assert_eq!(normalize_identifier(platform, "@"), None);
        }
    }

    #[test]
    fn test_requested_platforms_skip_blank_and_absent() {
        let request = PlatformRequest {
            twitch: Some("shroud".to_string()),
            youtube: Some("   ".to_string()),
            kick: None,
            tiktok: Some("@alice".to_string()),
        };

        assert_eq!(
            request.requested_platforms(),
            vec![Platform::Twitch, Platform::TikTok]
        );
        assert_eq!(request.identifier(Platform::TikTok).as_deref(), Some("alice"));
        assert_eq!(request.identifier(Platform::YouTube), None);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = ChatEnvelope::with_default_color(Platform::Kick, "bob", "hi");
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "platform": "kick",
                "user": "bob",
                "message": "hi",
                "color": "#00FF00"
            })
        );
    }

    #[test]
    fn test_platform_names_match_wire_format() {
        for platform in Platform::ALL {
            let json = serde_json::to_value(platform).unwrap();
            assert_eq!(json, serde_json::Value::String(platform.to_string()));
        }
    }
}

//! # Multi-stream Chat Aggregator
//!
//! Merges live chat from Twitch, Kick, TikTok and YouTube into one normalized
//! stream and broadcasts it to every viewer of a chat overlay.
//!
//! ## Features
//!
//! - **One envelope for every platform**: `{platform, user, message, color}`
//! - **Leak-free reconnects**: every session request tears down all platform
//!   connections before building the requested ones
//! - **Failure isolation**: a platform that fails to connect, drops its socket or
//!   changes its payload shape never takes the others down
//! - **Polling where there is no push**: YouTube chat is fetched on a fixed timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use multichat::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(AggregatorConfig::default());
//!     let bus = EventBus::new(config.bus.capacity);
//!     let mut viewer = bus.subscribe();
//!
//!     let factory = Arc::new(DefaultAdapterFactory::new(Arc::clone(&config))?);
//!     let orchestrator = SessionOrchestrator::new(bus, factory, Duration::from_secs(2));
//!
//!     orchestrator
//!         .reconnect_all(PlatformRequest {
//!             twitch: Some("shroud".to_string()),
//!             ..Default::default()
//!         })
//!         .await;
//!
//!     while let Ok(envelope) = viewer.recv().await {
//!         println!("[{}] {}: {}", envelope.platform(), envelope.user(), envelope.message());
//!     }
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod platforms;
pub mod session;
pub mod types;

#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bus::{EnvelopeSink, EventBus};
    pub use crate::config::{AggregatorConfig, ConfigError};
    pub use crate::platforms::{
        AdapterContext, AdapterFactory, DefaultAdapterFactory, PlatformConnection,
        kick::KickConnection,
        tiktok::TikTokConnection,
        twitch::TwitchConnection,
        youtube::YouTubeConnection,
    };
    pub use crate::session::{ConnectionRegistry, SessionOrchestrator};
    pub use crate::types::{normalize_identifier, ChatEnvelope, Platform, PlatformRequest};
    #[cfg(feature = "web")]
    pub use crate::web::WebServer;
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

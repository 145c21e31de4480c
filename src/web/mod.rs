use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::session::SessionOrchestrator;
use crate::types::{ChatEnvelope, PlatformRequest};

/// Overlay page shipped with the binary, served when the static directory has none
const BUNDLED_INDEX: &str = include_str!("../../public/index.html");

/// Frame sent to viewers for every envelope
#[derive(Debug, Serialize)]
struct ViewerFrame<'a> {
    event: &'static str,
    data: &'a ChatEnvelope,
}

fn viewer_frame(envelope: &ChatEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(&ViewerFrame {
        event: "message",
        data: envelope,
    })
}

#[derive(Clone)]
pub struct OverlayState {
    orchestrator: Arc<SessionOrchestrator>,
    bus: EventBus,
    static_dir: PathBuf,
}

/// Thin HTTP layer: serves the overlay, turns page loads into session requests,
/// and streams envelopes to viewers over WebSockets
pub struct WebServer {
    config: Arc<AggregatorConfig>,
    state: OverlayState,
}

impl WebServer {
    pub fn new(config: Arc<AggregatorConfig>, orchestrator: Arc<SessionOrchestrator>) -> Self {
        let state = OverlayState {
            bus: orchestrator.bus().clone(),
            orchestrator,
            static_dir: config.server.static_dir.clone(),
        };
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(overlay_page))
            .route("/ws", get(viewer_socket))
            .route("/health", get(health))
            .fallback_service(ServeDir::new(&self.state.static_dir))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn start_server<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = self.config.listen_address();
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        info!("Multi-stream chat running on http://{}", address);
        info!("Open /?twitch=<login>&kick=<user>&tiktok=<user>&youtube=<id> to start a session");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Overlay server failed")?;
        Ok(())
    }
}

async fn overlay_page(
    State(state): State<OverlayState>,
    Query(request): Query<PlatformRequest>,
) -> Html<String> {
    state.orchestrator.request_session(request);

    let index = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(page) => Html(page),
        Err(e) => {
            debug!("No overlay page at {} ({}), serving bundled page", index.display(), e);
            Html(BUNDLED_INDEX.to_string())
        }
    }
}

async fn viewer_socket(
    State(state): State<OverlayState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let receiver = state.bus.subscribe();
    upgrade.on_upgrade(move |socket| viewer_session(socket, receiver))
}

async fn viewer_session(socket: WebSocket, mut receiver: broadcast::Receiver<ChatEnvelope>) {
    let viewer_id = Uuid::new_v4();
    info!("Viewer {} connected", viewer_id);

    let (mut outgoing, mut incoming) = socket.split();

    loop {
        tokio::select! {
            envelope = receiver.recv() => match envelope {
                Ok(envelope) => {
                    let frame = match viewer_frame(&envelope) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Failed to encode envelope for viewer {}: {}", viewer_id, e);
                            continue;
                        }
                    };
                    if outgoing.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Viewer {} fell behind, skipped {} messages", viewer_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    info!("Viewer {} disconnected", viewer_id);
}

async fn health(State(state): State<OverlayState>) -> Json<serde_json::Value> {
    let platforms = state.orchestrator.active_platforms().await;
    Json(serde_json::json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "viewers": state.bus.viewer_count(),
        "generation": state.bus.current_generation(),
        "platforms": platforms,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::DefaultAdapterFactory;
    use crate::types::Platform;
    use std::time::Duration;
    use tempfile::tempdir;

    fn state(static_dir: PathBuf) -> OverlayState {
        let config = Arc::new(AggregatorConfig::default());
        let bus = EventBus::new(8);
        let orchestrator = SessionOrchestrator::new(
            bus.clone(),
            Arc::new(DefaultAdapterFactory::new(config).unwrap()),
            Duration::from_millis(100),
        );
        OverlayState {
            orchestrator,
            bus,
            static_dir,
        }
    }

    #[test]
    fn test_viewer_frame_shape() {
        let envelope = ChatEnvelope::with_default_color(Platform::YouTube, "Viewer", "hello 😀");
        let frame: serde_json::Value =
            serde_json::from_str(&viewer_frame(&envelope).unwrap()).unwrap();

        assert_eq!(
            frame,
            serde_json::json!({
                "event": "message",
                "data": {
                    "platform": "youtube",
                    "user": "Viewer",
                    "message": "hello 😀",
                    "color": "#FF0000"
                }
            })
        );
    }

    #[tokio::test]
    async fn test_overlay_page_prefers_static_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>custom</h1>").unwrap();

        let Html(page) = overlay_page(
            State(state(dir.path().to_path_buf())),
            Query(PlatformRequest::default()),
        )
        .await;

        assert_eq!(page, "<h1>custom</h1>");
    }

    #[tokio::test]
    async fn test_overlay_page_falls_back_to_bundled() {
        let dir = tempdir().unwrap();

        let Html(page) = overlay_page(
            State(state(dir.path().to_path_buf())),
            Query(PlatformRequest::default()),
        )
        .await;

        assert_eq!(page, BUNDLED_INDEX);
    }

    #[tokio::test]
    async fn test_health_reports_viewers() {
        let dir = tempdir().unwrap();
        let state = state(dir.path().to_path_buf());
        let _viewer = state.bus.subscribe();

        let Json(body) = health(State(state)).await;

        assert_eq!(body["status"], "running");
        assert_eq!(body["viewers"], 1);
        assert_eq!(body["platforms"], serde_json::json!([]));
    }
}

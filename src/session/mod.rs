use log::{debug, error, info};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::bus::EventBus;
use crate::platforms::{AdapterContext, AdapterFactory, ReconnectRequest, ReconnectTrigger};
use crate::types::{Platform, PlatformRequest};

pub mod registry;

pub use registry::ConnectionRegistry;

/// Tears down and rebuilds platform connections whenever a session is requested.
///
/// Passes are serialized by the registry lock: a pass always tears down every slot
/// before storing anything new, so two generations of the same platform never
/// coexist in the registry.
pub struct SessionOrchestrator {
    registry: Mutex<ConnectionRegistry>,
    factory: Arc<dyn AdapterFactory>,
    bus: EventBus,
    viewer_tx: mpsc::UnboundedSender<PlatformRequest>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
}

impl SessionOrchestrator {
    /// Build the orchestrator and start its request queue. Must run inside a tokio runtime.
    pub fn new(
        bus: EventBus,
        factory: Arc<dyn AdapterFactory>,
        teardown_timeout: Duration,
    ) -> Arc<Self> {
        let (viewer_tx, viewer_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            registry: Mutex::new(ConnectionRegistry::new(teardown_timeout)),
            factory,
            bus,
            viewer_tx,
            reconnect_tx,
        });

        tokio::spawn(Self::process_requests(
            Arc::downgrade(&orchestrator),
            viewer_rx,
            reconnect_rx,
        ));

        orchestrator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Queue a pass for a viewer's request and return immediately.
    /// Queued passes run one after another in arrival order.
    pub fn request_session(&self, request: PlatformRequest) {
        if self.viewer_tx.send(request).is_err() {
            error!("Session queue is closed, request dropped");
        }
    }

    /// Run one orchestration pass: tear everything down, then connect each requested platform.
    pub async fn reconnect_all(&self, request: PlatformRequest) {
        info!("Reconnecting platforms: {:?}", request.requested_platforms());

        let mut registry = self.registry.lock().await;
        let generation = self.bus.advance_generation();
        registry.teardown_all().await;

        for platform in Platform::ALL {
            let Some(identifier) = request.identifier(platform) else {
                debug!("{} not requested, slot left empty", platform);
                continue;
            };

            let context = AdapterContext {
                sink: self.bus.sink(generation),
                reconnect: ReconnectTrigger::new(
                    self.reconnect_tx.clone(),
                    generation,
                    request.clone(),
                ),
            };

            let mut adapter = self.factory.create(platform, context);
            match adapter.connect(&identifier).await {
                Ok(()) => registry.store(platform, adapter),
                Err(e) => error!(
                    "Could not start {} connection for '{}': {:#}",
                    platform, identifier, e
                ),
            }
        }

        info!(
            "Generation {} active with {:?}",
            generation,
            registry.platforms()
        );
    }

    /// Platforms with a live slot
    pub async fn active_platforms(&self) -> Vec<Platform> {
        self.registry.lock().await.platforms()
    }

    /// Tear everything down and silence any stragglers
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        self.bus.advance_generation();
        registry.teardown_all().await;
        info!("Session orchestrator shut down");
    }

    async fn process_requests(
        orchestrator: Weak<Self>,
        mut viewer_rx: mpsc::UnboundedReceiver<PlatformRequest>,
        mut reconnect_rx: mpsc::UnboundedReceiver<ReconnectRequest>,
    ) {
        loop {
            let request = tokio::select! {
                Some(request) = viewer_rx.recv() => request,
                Some(reconnect) = reconnect_rx.recv() => {
                    let Some(orchestrator) = orchestrator.upgrade() else { break };
                    let current = orchestrator.bus.current_generation();
                    if reconnect.generation != current {
                        debug!(
                            "Ignoring reconnect from generation {} (current {})",
                            reconnect.generation, current
                        );
                        continue;
                    }
                    info!("Platform asked for a full reconnect of generation {}", current);
                    reconnect.request
                }
                else => break,
            };

            match orchestrator.upgrade() {
                Some(orchestrator) => orchestrator.reconnect_all(request).await,
                None => break,
            }
        }

        debug!("Session request queue closed");
    }
}

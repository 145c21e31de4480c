use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::EnvelopeSink;
use crate::config::AggregatorConfig;
use crate::types::{Platform, PlatformRequest};

pub mod kick;
pub mod poller;
pub mod tiktok;
pub mod twitch;
pub mod youtube;

use kick::KickConnection;
use tiktok::TikTokConnection;
use twitch::TwitchConnection;
use youtube::YouTubeConnection;

/// Trait every platform adapter implements.
///
/// Adapters emit through the [`EnvelopeSink`] they were built with, so nothing
/// downstream ever sees a platform's native payload.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Begin connecting to `identifier` (already normalized).
    ///
    /// Returns as soon as the attempt is scheduled. Network failures after that point
    /// are logged by the adapter and never reach the caller.
    async fn connect(&mut self, identifier: &str) -> Result<()>;

    /// Platform this adapter serves
    fn platform(&self) -> Platform;

    /// Identifier passed to the last `connect`
    fn identifier(&self) -> Option<&str>;

    /// Whether the underlying channel is currently open
    async fn is_connected(&self) -> bool;

    /// Best-effort close. Calling it twice is harmless.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Request to rerun an orchestration pass, stamped with the generation that asked
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    pub generation: u64,
    pub request: PlatformRequest,
}

/// Lets an adapter ask the orchestrator to rebuild every platform
#[derive(Clone)]
pub struct ReconnectTrigger {
    sender: mpsc::UnboundedSender<ReconnectRequest>,
    generation: u64,
    request: PlatformRequest,
}

impl ReconnectTrigger {
    pub fn new(
        sender: mpsc::UnboundedSender<ReconnectRequest>,
        generation: u64,
        request: PlatformRequest,
    ) -> Self {
        Self {
            sender,
            generation,
            request,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a full reconnect with the request this adapter was created for.
    /// Returns `false` when the orchestrator is gone.
    pub fn fire(&self) -> bool {
        self.sender
            .send(ReconnectRequest {
                generation: self.generation,
                request: self.request.clone(),
            })
            .is_ok()
    }
}

/// Everything an adapter needs from the session that created it
#[derive(Clone)]
pub struct AdapterContext {
    pub sink: EnvelopeSink,
    pub reconnect: ReconnectTrigger,
}

/// Builds adapters for the orchestrator
pub trait AdapterFactory: Send + Sync {
    fn create(&self, platform: Platform, context: AdapterContext) -> Box<dyn PlatformConnection>;
}

/// Factory producing the real network adapters
pub struct DefaultAdapterFactory {
    config: Arc<AggregatorConfig>,
    http_client: reqwest::Client,
}

impl DefaultAdapterFactory {
    /// The shared HTTP client gives up on any request after `session.http_timeout_ms`
    pub fn new(config: Arc<AggregatorConfig>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.session.http_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, platform: Platform, context: AdapterContext) -> Box<dyn PlatformConnection> {
        debug!("Creating {} adapter", platform);
        match platform {
            Platform::Twitch => Box::new(TwitchConnection::new(
                self.config.twitch.clone(),
                context,
            )),
            Platform::Kick => Box::new(KickConnection::new(
                self.config.kick.clone(),
                self.http_client.clone(),
                context,
            )),
            Platform::TikTok => Box::new(TikTokConnection::new(
                self.config.tiktok.clone(),
                context,
            )),
            Platform::YouTube => Box::new(YouTubeConnection::new(
                self.config.youtube.clone(),
                self.http_client.clone(),
                context,
            )),
        }
    }
}

/// Background connection task with a graceful stop signal.
///
/// `stop` lets the task close its socket cleanly. Dropping without `stop` aborts it.
pub(crate) struct ConnectionTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ConnectionTask {
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(shutdown_rx));
        Self {
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub(crate) fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(()).is_err() {
                debug!("Connection task already finished");
            }
        }
    }
}

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_carries_generation_and_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = PlatformRequest {
            kick: Some("xqc".to_string()),
            ..Default::default()
        };
        let trigger = ReconnectTrigger::new(tx, 7, request.clone());

        assert!(trigger.fire());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.generation, 7);
        assert_eq!(received.request, request);
    }

    #[test]
    fn test_trigger_reports_closed_orchestrator() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let trigger = ReconnectTrigger::new(tx, 1, PlatformRequest::default());
        assert!(!trigger.fire());
    }

    #[tokio::test]
    async fn test_factory_builds_matching_platforms() {
        let factory = DefaultAdapterFactory::new(Arc::new(AggregatorConfig::default())).unwrap();
        let bus = EventBus::new(8);
        let (tx, _rx) = mpsc::unbounded_channel();

        for platform in Platform::ALL {
            let context = AdapterContext {
                sink: bus.sink(0),
                reconnect: ReconnectTrigger::new(tx.clone(), 0, PlatformRequest::default()),
            };
            let adapter = factory.create(platform, context);
            assert_eq!(adapter.platform(), platform);
            assert_eq!(adapter.identifier(), None);
            assert!(!adapter.is_connected().await);
        }
    }

    #[tokio::test]
    async fn test_factory_client_gives_up_on_silent_server() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = AggregatorConfig::default();
        config.session.http_timeout_ms = 200;
        let factory = DefaultAdapterFactory::new(Arc::new(config)).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            factory.http_client.get(format!("http://{}/channels/xqc", address)).send(),
        )
        .await
        .expect("client should time out on its own")
        .unwrap_err();

        assert!(err.is_timeout());
        server.abort();
    }

    #[tokio::test]
    async fn test_stop_signals_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);

        let task = ConnectionTask::spawn(move |shutdown| async move {
            let _ = shutdown.await;
            flag.store(true, Ordering::SeqCst);
        });
        task.stop();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !stopped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("task should observe shutdown");
    }
}

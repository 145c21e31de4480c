use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;

use crate::platforms::PlatformConnection;
use crate::types::Platform;

/// Owns the live adapter for each platform slot, at most one per platform
pub struct ConnectionRegistry {
    slots: HashMap<Platform, Box<dyn PlatformConnection>>,
    teardown_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(teardown_timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            teardown_timeout,
        }
    }

    /// Disconnect every held adapter and empty all slots.
    ///
    /// Failures and timeouts are logged per handle and never stop the remaining
    /// teardowns. Slots are cleared whether or not the disconnect succeeded.
    pub async fn teardown_all(&mut self) {
        if self.slots.is_empty() {
            return;
        }

        for (platform, mut handle) in self.slots.drain() {
            match timeout(self.teardown_timeout, handle.disconnect()).await {
                Ok(Ok(())) => debug!("Tore down {} connection", platform),
                Ok(Err(e)) => warn!(
                    "Abandoning {} connection after failed disconnect: {:#}",
                    platform, e
                ),
                Err(_) => warn!(
                    "Abandoning {} connection, disconnect took longer than {:?}",
                    platform, self.teardown_timeout
                ),
            }
        }

        info!("All platform connections torn down");
    }

    /// Put a fresh adapter into its slot. The slot is expected to be empty.
    pub fn store(&mut self, platform: Platform, handle: Box<dyn PlatformConnection>) {
        if let Some(previous) = self.slots.insert(platform, handle) {
            warn!(
                "Replaced a {} connection that was never torn down ({:?})",
                platform,
                previous.identifier()
            );
        }
    }

    pub fn get(&self, platform: Platform) -> Option<&dyn PlatformConnection> {
        self.slots.get(&platform).map(|handle| &**handle)
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.slots.contains_key(&platform)
    }

    /// Occupied slots, in platform order
    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.slots.contains_key(p))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Behaviour {
        Clean,
        Fails,
        Hangs,
    }

    struct StubConnection {
        platform: Platform,
        behaviour: Behaviour,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PlatformConnection for StubConnection {
        async fn connect(&mut self, _identifier: &str) -> Result<()> {
            Ok(())
        }

        fn platform(&self) -> Platform {
            self.platform
        }

        fn identifier(&self) -> Option<&str> {
            Some("stub")
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Clean => Ok(()),
                Behaviour::Fails => Err(anyhow!("socket already gone")),
                Behaviour::Hangs => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }

    fn stub(
        platform: Platform,
        behaviour: Behaviour,
        disconnects: &Arc<AtomicUsize>,
    ) -> Box<dyn PlatformConnection> {
        Box::new(StubConnection {
            platform,
            behaviour,
            disconnects: Arc::clone(disconnects),
        })
    }

    #[tokio::test]
    async fn test_teardown_on_empty_registry_is_noop() {
        let mut registry = ConnectionRegistry::new(Duration::from_millis(100));
        registry.teardown_all().await;
        registry.teardown_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_clears_every_slot() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new(Duration::from_millis(100));
        for platform in Platform::ALL {
            registry.store(platform, stub(platform, Behaviour::Clean, &disconnects));
        }
        assert_eq!(registry.len(), 4);

        registry.teardown_all().await;

        assert!(registry.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_hanging_handles_do_not_block_others() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new(Duration::from_secs(2));
        registry.store(Platform::Twitch, stub(Platform::Twitch, Behaviour::Fails, &disconnects));
        registry.store(Platform::Kick, stub(Platform::Kick, Behaviour::Hangs, &disconnects));
        registry.store(Platform::YouTube, stub(Platform::YouTube, Behaviour::Clean, &disconnects));

        registry.teardown_all().await;

        assert!(registry.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new(Duration::from_millis(100));
        registry.store(Platform::YouTube, stub(Platform::YouTube, Behaviour::Clean, &disconnects));
        registry.store(Platform::Twitch, stub(Platform::Twitch, Behaviour::Clean, &disconnects));

        assert!(registry.contains(Platform::Twitch));
        assert!(!registry.contains(Platform::Kick));
        assert_eq!(registry.platforms(), vec![Platform::Twitch, Platform::YouTube]);
        assert_eq!(registry.get(Platform::YouTube).map(|h| h.platform()), Some(Platform::YouTube));
    }

    #[tokio::test]
    async fn test_store_never_holds_two_handles_per_slot() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new(Duration::from_millis(100));
        registry.store(Platform::Kick, stub(Platform::Kick, Behaviour::Clean, &disconnects));
        registry.store(Platform::Kick, stub(Platform::Kick, Behaviour::Clean, &disconnects));

        assert_eq!(registry.len(), 1);
    }
}

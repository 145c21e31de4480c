// src/bus/mod.rs - Fan-out of normalized envelopes to every connected viewer

use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::ChatEnvelope;

/// Broadcast channel shared by every adapter and every viewer.
///
/// The bus also carries the current orchestration generation. Envelopes emitted
/// through a sink from an older generation are dropped, so a superseded connection
/// that is still finishing its handshake cannot leak messages into the new session.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEnvelope>,
    generation: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe a new viewer
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEnvelope> {
        self.sender.subscribe()
    }

    /// Number of viewers currently subscribed
    pub fn viewer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Deliver an envelope to every viewer. Returns how many received it.
    ///
    /// Having no viewers is not an error: the envelope is simply discarded.
    pub fn publish(&self, envelope: ChatEnvelope) -> usize {
        match self.sender.send(envelope) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(envelope)) => {
                debug!(
                    "No viewers connected, dropping {} message from {}",
                    envelope.platform(),
                    envelope.user()
                );
                0
            }
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new orchestration generation, invalidating every existing sink
    pub fn advance_generation(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Event bus entering generation {}", next);
        next
    }

    /// Sink stamped with `generation` for one adapter to emit through
    pub fn sink(&self, generation: u64) -> EnvelopeSink {
        EnvelopeSink {
            bus: self.clone(),
            generation,
        }
    }
}

/// Write side of the bus handed to a single adapter
#[derive(Clone)]
pub struct EnvelopeSink {
    bus: EventBus,
    generation: u64,
}

impl EnvelopeSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this sink still belongs to the live orchestration pass
    pub fn is_current(&self) -> bool {
        self.bus.current_generation() == self.generation
    }

    /// Publish an envelope unless this sink has been superseded.
    /// Returns `true` when the envelope reached the bus.
    pub fn emit(&self, envelope: ChatEnvelope) -> bool {
        if !self.is_current() {
            debug!(
                "Dropping stale {} message from generation {} (current {})",
                envelope.platform(),
                self.generation,
                self.bus.current_generation()
            );
            return false;
        }
        self.bus.publish(envelope);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;

    fn envelope(text: &str) -> ChatEnvelope {
        ChatEnvelope::with_default_color(Platform::Twitch, "viewer", text)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_viewer() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.viewer_count(), 2);
        assert_eq!(bus.publish(envelope("hello")), 2);

        assert_eq!(first.recv().await.unwrap().message(), "hello");
        assert_eq!(second.recv().await.unwrap().message(), "hello");
    }

    #[test]
    fn test_publish_without_viewers_is_not_an_error() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(envelope("nobody home")), 0);
    }

    #[tokio::test]
    async fn test_stale_sink_is_silenced() {
        let bus = EventBus::new(16);
        let mut viewer = bus.subscribe();

        let old_sink = bus.sink(bus.advance_generation());
        let new_sink = bus.sink(bus.advance_generation());

        assert!(!old_sink.is_current());
        assert!(!old_sink.emit(envelope("late")));
        assert!(new_sink.emit(envelope("fresh")));

        assert_eq!(viewer.recv().await.unwrap().message(), "fresh");
        assert!(viewer.try_recv().is_err());
    }

    #[test]
    fn test_generations_increase() {
        let bus = EventBus::new(4);
        assert_eq!(bus.current_generation(), 0);
        assert_eq!(bus.advance_generation(), 1);
        assert_eq!(bus.advance_generation(), 2);
        assert_eq!(bus.sink(2).generation(), 2);
    }
}

//! Broadcast bus for healing-run events.
//!
//! Wraps `tokio::sync::broadcast` so every observer gets its own copy of
//! each event. A slow observer lags and loses events; the run never waits.

use mend_core::event::{HealEvent, HealEventKind};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Clones share one channel: emitting on any clone reaches every subscriber.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<HealEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, kind: HealEventKind) {
        tracing::trace!(event = %kind, "heal event");
        let _ = self.tx.send(HealEvent::new(kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

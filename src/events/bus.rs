//! Event Bus - fan-out of lifecycle events
//!
//! Delivery has two paths: a tokio broadcast channel for async consumers
//! and registered callback handlers for config-supplied hooks. A handler
//! that panics is logged and swallowed; it never aborts delivery to the
//! rest.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::LoopEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Registered callback handler
type Handler = Box<dyn Fn(&LoopEvent) + Send + Sync>;

/// Central event bus for orchestrator lifecycle events
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to every subscriber and handler
    ///
    /// Fire-and-forget on the broadcast side: with no subscribers the event
    /// is dropped there, but handlers still run.
    pub fn emit(&self, event: LoopEvent) {
        debug!(event_type = event.event_type(), "EventBus::emit");

        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                warn!(event_type = event.event_type(), "Event handler panicked; continuing delivery");
            }
        }
        drop(handlers);

        let _ = self.tx.send(event);
    }

    /// Register a callback handler invoked synchronously on every event
    pub fn on(&self, handler: impl Fn(&LoopEvent) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Subscribe to receive events on a broadcast channel
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    /// Number of active broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

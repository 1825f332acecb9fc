//! Lifecycle events
//!
//! Structured records emitted at every significant point of a run, fanned
//! out to subscribers and config callbacks.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus};
pub use logger::spawn_event_logger;
pub use types::LoopEvent;

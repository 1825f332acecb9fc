//! Event logger - mirrors bus events to the diagnostic stream
//!
//! Subscribes to the EventBus and re-emits every event through `tracing`
//! so a run leaves a structured trail on stderr without any consumer
//! wiring.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::bus::EventBus;
use super::types::LoopEvent;

/// Spawn a task that logs every bus event until the bus is dropped
pub fn spawn_event_logger(bus: &Arc<EventBus>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event logger lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &LoopEvent) {
    match event {
        LoopEvent::LoopFailed { error, .. } => warn!(error = %error, "loop_failed"),
        LoopEvent::TaskFailed { task_id, error, attempts, .. } => {
            warn!(%task_id, %error, attempts, "task_failed")
        }
        LoopEvent::CircuitBreakerTripped { consecutive_failures, .. } => {
            warn!(consecutive_failures, "circuit_breaker_tripped")
        }
        other => info!(event_type = other.event_type(), task_id = ?other.task_id(), "event"),
    }
}

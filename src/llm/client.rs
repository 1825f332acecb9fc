//! LlmClient trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{LlmError, LlmEvent, LlmRequest};

/// A finite, non-restartable sequence of events from one invocation
///
/// Must be fully drained or dropped (dropping cancels the producer).
/// Suspension happens between events; callers may mutate session state
/// between two consecutive events.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<LlmEvent>,
}

impl EventStream {
    /// Wrap a channel receiver
    pub fn new(rx: mpsc::Receiver<LlmEvent>) -> Self {
        Self { rx }
    }

    /// Build a stream from an already-materialized event list
    ///
    /// Used by backends that produce a single synthetic event.
    pub fn from_events(events: Vec<LlmEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity matches the event count, send cannot fail
            let _ = tx.try_send(event);
        }
        Self { rx }
    }

    /// Receive the next event, or None when the sequence is finished
    pub async fn next(&mut self) -> Option<LlmEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<LlmEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Narrow interface every LLM backend implements
///
/// Each invocation is independent - no conversation state is maintained
/// between calls; callers carry history in the request messages.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Produce the event sequence for one request
    async fn generate(&self, request: LlmRequest) -> Result<EventStream, LlmError>;

    /// Open a streaming connection
    ///
    /// Backends without true streaming fail with `StreamingNotSupported`.
    async fn connect(&self, _request: LlmRequest) -> Result<EventStream, LlmError> {
        Err(LlmError::StreamingNotSupported)
    }

    /// Provider name this client talks to
    fn provider(&self) -> &str;
}

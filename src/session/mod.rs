//! Session store
//!
//! Keyed persistence for per-task event history and state. A session is
//! scoped to a single task; concurrent access to the same session is
//! forbidden by contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmEvent;

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::InMemorySessionStore;

/// Session identifier (uuid v7)
pub type SessionId = String;

/// Errors from session store operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session store closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A session's full recorded content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub app_name: String,
    pub user_id: String,
    pub state: HashMap<String, serde_json::Value>,
    pub events: Vec<LlmEvent>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Abstract map from session id to event history plus state bag
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session with initial state, returning its id
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: HashMap<String, serde_json::Value>,
    ) -> Result<SessionId, SessionError>;

    /// Append events to a session's history
    async fn append_events(&self, id: &str, events: &[LlmEvent]) -> Result<(), SessionError>;

    /// Read back a session's event history
    async fn get_events(&self, id: &str) -> Result<Vec<LlmEvent>, SessionError>;

    /// Merge keys into a session's state bag
    async fn put_state(&self, id: &str, delta: HashMap<String, serde_json::Value>) -> Result<(), SessionError>;

    /// Read a session's state bag
    async fn get_state(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, SessionError>;

    /// Close the store, releasing resources
    async fn close(&self) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shared conformance checks run against both implementations
    pub(super) async fn check_store(store: &dyn SessionStore) {
        let id = store
            .create_session("app", "user", HashMap::from([("taskId".to_string(), "t1".into())]))
            .await
            .unwrap();

        // Initial state round-trips
        let state = store.get_state(&id).await.unwrap();
        assert_eq!(state.get("taskId").unwrap(), "t1");

        // Events append in order
        store
            .append_events(&id, &[LlmEvent::text("agent", "one"), LlmEvent::text("agent", "two")])
            .await
            .unwrap();
        store.append_events(&id, &[LlmEvent::text("agent", "three")]).await.unwrap();

        let events = store.get_events(&id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].first_text(), Some("three"));

        // State merge overwrites per key, keeps the rest
        store
            .put_state(&id, HashMap::from([("attempt".to_string(), 2.into())]))
            .await
            .unwrap();
        let state = store.get_state(&id).await.unwrap();
        assert_eq!(state.get("taskId").unwrap(), "t1");
        assert_eq!(state.get("attempt").unwrap(), 2);

        // Unknown sessions error
        assert!(matches!(
            store.get_events("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }
}

//! Volatile in-memory session store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::llm::LlmEvent;
use crate::util::now_ms;

use super::{SessionError, SessionId, SessionRecord, SessionStore};

/// In-memory store; everything is dropped on close
pub struct InMemorySessionStore {
    sessions: Mutex<Option<HashMap<SessionId, SessionRecord>>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Some(HashMap::new())),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: HashMap<String, serde_json::Value>,
    ) -> Result<SessionId, SessionError> {
        let id = Uuid::now_v7().to_string();
        debug!(%id, app_name, "InMemorySessionStore::create_session");

        let now = now_ms();
        let record = SessionRecord {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut guard = self.sessions.lock().await;
        guard.as_mut().ok_or(SessionError::Closed)?.insert(id.clone(), record);
        Ok(id)
    }

    async fn append_events(&self, id: &str, events: &[LlmEvent]) -> Result<(), SessionError> {
        let mut guard = self.sessions.lock().await;
        let sessions = guard.as_mut().ok_or(SessionError::Closed)?;
        let record = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        record.events.extend_from_slice(events);
        record.updated_at = now_ms();
        Ok(())
    }

    async fn get_events(&self, id: &str) -> Result<Vec<LlmEvent>, SessionError> {
        let guard = self.sessions.lock().await;
        let sessions = guard.as_ref().ok_or(SessionError::Closed)?;
        sessions
            .get(id)
            .map(|r| r.events.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn put_state(&self, id: &str, delta: HashMap<String, serde_json::Value>) -> Result<(), SessionError> {
        let mut guard = self.sessions.lock().await;
        let sessions = guard.as_mut().ok_or(SessionError::Closed)?;
        let record = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        record.state.extend(delta);
        record.updated_at = now_ms();
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, SessionError> {
        let guard = self.sessions.lock().await;
        let sessions = guard.as_ref().ok_or(SessionError::Closed)?;
        sessions
            .get(id)
            .map(|r| r.state.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn close(&self) -> Result<(), SessionError> {
        debug!("InMemorySessionStore::close");
        *self.sessions.lock().await = None;
        Ok(())
    }
}

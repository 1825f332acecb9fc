//! Persistent file-backed session store
//!
//! One JSON file per session under a configurable directory, written
//! atomically (temp-then-rename) so a crash never leaves a torn file.
//! Enables resume in single-agent mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::LlmEvent;
use crate::util::now_ms;

use super::{SessionError, SessionId, SessionRecord, SessionStore};

/// Sessions older than this are pruned when the store opens
const GC_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// File-backed store with per-session JSON files
pub struct FileSessionStore {
    dir: PathBuf,
    // Serializes writes; per-session concurrency is forbidden by contract
    // but cross-session writes share the directory.
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, pruning stale sessions
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SessionError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            lock: Mutex::new(()),
        };
        store.gc();
        Ok(store)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read_record(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_record(&self, id: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let path = self.session_path(id);
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        std::fs::write(&tmp, serde_json::to_string(record)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Prune session files older than the GC age
    fn gc(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };

        let cutoff = SystemTime::now() - GC_MAX_AGE;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if stale {
                debug!(path = %path.display(), "FileSessionStore: pruning stale session");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to prune session file");
                }
            }
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: HashMap<String, serde_json::Value>,
    ) -> Result<SessionId, SessionError> {
        let id = Uuid::now_v7().to_string();
        debug!(%id, app_name, "FileSessionStore::create_session");

        let now = now_ms();
        let record = SessionRecord {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let _guard = self.lock.lock().await;
        self.write_record(&id, &record)?;
        Ok(id)
    }

    async fn append_events(&self, id: &str, events: &[LlmEvent]) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        let mut record = self.read_record(id)?;
        record.events.extend_from_slice(events);
        record.updated_at = now_ms();
        self.write_record(id, &record)
    }

    async fn get_events(&self, id: &str) -> Result<Vec<LlmEvent>, SessionError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_record(id)?.events)
    }

    async fn put_state(&self, id: &str, delta: HashMap<String, serde_json::Value>) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        let mut record = self.read_record(id)?;
        record.state.extend(delta);
        record.updated_at = now_ms();
        self.write_record(id, &record)
    }

    async fn get_state(&self, id: &str) -> Result<HashMap<String, serde_json::Value>, SessionError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_record(id)?.state)
    }

    async fn close(&self) -> Result<(), SessionError> {
        // Files are the source of truth; nothing to flush
        Ok(())
    }
}

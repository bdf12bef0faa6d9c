//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use foldback_core::{
    Checkpoint, Entry, Sequence, SessionId, SessionMeta, SessionState, SessionStorage,
    StorageError, StoredSession,
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut StoredSession) -> T,
    ) -> Result<T, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        Ok(f(session))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn create(&self, meta: &SessionMeta) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if sessions.contains_key(&meta.id) {
            return Err(StorageError::AlreadyExists(meta.id));
        }
        sessions.insert(meta.id, StoredSession::new(meta.clone()));

        Ok(())
    }

    async fn append_entry(&self, id: SessionId, entry: &Entry) -> Result<(), StorageError> {
        self.with_session(id, |s| s.apply_entry(entry.clone()))
    }

    async fn append_checkpoint(
        &self,
        id: SessionId,
        marker: &Entry,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        self.with_session(id, |s| s.apply_checkpoint(marker.clone(), checkpoint))
    }

    async fn revert(
        &self,
        id: SessionId,
        position: Sequence,
        fold: &Entry,
        detached: &[SessionId],
    ) -> Result<(), StorageError> {
        self.with_session(id, |s| s.apply_revert(position, fold.clone(), detached))
    }

    async fn append_summary(
        &self,
        parent: SessionId,
        summary: &Entry,
        child: SessionId,
    ) -> Result<(), StorageError> {
        self.with_session(parent, |s| s.apply_summary(summary.clone(), child))
    }

    async fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), StorageError> {
        self.with_session(id, |s| s.meta.state = state)
    }

    async fn load(&self, id: SessionId) -> Result<Option<StoredSession>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<SessionMeta>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<SessionMeta> = sessions.values().map(|s| s.meta.clone()).collect();

        // Oldest first
        result.sort_by_key(|m| (m.created_at, m.id));

        Ok(result)
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }
}

//! Session identity, lifecycle state and the storage trait.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    checkpoint::Checkpoint,
    entry::{Entry, Sequence},
};

/// Session identifier.
pub type SessionId = Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting appends, spawns and reverts.
    Active,
    /// Finished normally; its summary was delivered to the parent.
    Completed,
    /// Orphaned by an ancestor revert.
    Terminated,
}

impl SessionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

/// Persisted identity and position of a session in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Unique session identifier.
    pub id: SessionId,
    /// Parent session, if this is a sub-agent.
    pub parent: Option<SessionId>,
    /// Parent's next sequence at the moment of spawn.
    pub spawn_point: Option<Sequence>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

impl SessionMeta {
    /// Metadata for a new root session.
    #[must_use]
    pub const fn root(id: SessionId, created_at: i64) -> Self {
        Self {
            id,
            parent: None,
            spawn_point: None,
            state: SessionState::Active,
            created_at,
        }
    }

    /// Metadata for a new child spawned at `spawn_point` of `parent`.
    #[must_use]
    pub const fn child(
        id: SessionId,
        parent: SessionId,
        spawn_point: Sequence,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            parent: Some(parent),
            spawn_point: Some(spawn_point),
            state: SessionState::Active,
            created_at,
        }
    }
}

/// Everything needed to rebuild one session after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub meta: SessionMeta,
    /// Live entries in sequence order.
    pub entries: Vec<Entry>,
    /// Next sequence the log will assign.
    pub next_sequence: Sequence,
    /// Currently valid checkpoints.
    pub checkpoints: Vec<Checkpoint>,
    /// Number of checkpoint ids ever issued.
    pub checkpoints_issued: u64,
    /// Children cut off by this session's reverts.
    pub detached: Vec<SessionId>,
    /// Children whose summary was delivered into this session.
    pub completed: Vec<SessionId>,
}

impl StoredSession {
    /// Fresh state for a newly created session.
    #[must_use]
    pub const fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            entries: Vec::new(),
            next_sequence: 1,
            checkpoints: Vec::new(),
            checkpoints_issued: 0,
            detached: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Apply an appended entry.
    pub fn apply_entry(&mut self, entry: Entry) {
        self.next_sequence = self.next_sequence.max(entry.sequence + 1);
        self.entries.push(entry);
    }

    /// Apply an appended marker and its checkpoint.
    pub fn apply_checkpoint(&mut self, marker: Entry, checkpoint: Checkpoint) {
        self.apply_entry(marker);
        self.checkpoints_issued = self.checkpoints_issued.max(checkpoint.id.0 + 1);
        self.checkpoints.push(checkpoint);
    }

    /// Apply a revert: cut after `position`, drop later checkpoints, record
    /// the detached children, append the fold.
    pub fn apply_revert(&mut self, position: Sequence, fold: Entry, detached: &[SessionId]) {
        self.entries.retain(|e| e.sequence <= position);
        self.checkpoints.retain(|c| c.position <= position);
        self.detached.extend_from_slice(detached);
        self.apply_entry(fold);
    }

    /// Apply a child's summary delivered into this session.
    pub fn apply_summary(&mut self, summary: Entry, child: SessionId) {
        self.completed.push(child);
        self.apply_entry(summary);
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed journal {path}:{line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn malformed(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

/// Trait for durable session backends.
///
/// Layout mirrors the data model: one ordered-entry store and one
/// checkpoint index per session, keyed by session id. Every write is issued
/// while the owning session is locked, so calls for one session never race.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Create a new, empty session.
    async fn create(&self, meta: &SessionMeta) -> Result<(), StorageError>;

    /// Append an ordinary entry.
    async fn append_entry(&self, id: SessionId, entry: &Entry) -> Result<(), StorageError>;

    /// Append a marker entry and register its checkpoint.
    async fn append_checkpoint(
        &self,
        id: SessionId,
        marker: &Entry,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError>;

    /// Truncate after `position`, invalidate later checkpoints, append `fold`.
    ///
    /// `detached` names the children this revert cuts off. They are written
    /// with the revert so a restart never re-links them.
    async fn revert(
        &self,
        id: SessionId,
        position: Sequence,
        fold: &Entry,
        detached: &[SessionId],
    ) -> Result<(), StorageError>;

    /// Append `child`'s summary to `parent` and record the delivery.
    async fn append_summary(
        &self,
        parent: SessionId,
        summary: &Entry,
        child: SessionId,
    ) -> Result<(), StorageError>;

    /// Update lifecycle state.
    async fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), StorageError>;

    /// Load a session.
    async fn load(&self, id: SessionId) -> Result<Option<StoredSession>, StorageError>;

    /// List all stored sessions, oldest first.
    async fn list(&self) -> Result<Vec<SessionMeta>, StorageError>;

    /// Delete a session.
    async fn remove(&self, id: SessionId) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: SessionStorage + ?Sized> SessionStorage for Box<T> {
    async fn create(&self, meta: &SessionMeta) -> Result<(), StorageError> {
        (**self).create(meta).await
    }

    async fn append_entry(&self, id: SessionId, entry: &Entry) -> Result<(), StorageError> {
        (**self).append_entry(id, entry).await
    }

    async fn append_checkpoint(
        &self,
        id: SessionId,
        marker: &Entry,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        (**self).append_checkpoint(id, marker, checkpoint).await
    }

    async fn revert(
        &self,
        id: SessionId,
        position: Sequence,
        fold: &Entry,
        detached: &[SessionId],
    ) -> Result<(), StorageError> {
        (**self).revert(id, position, fold, detached).await
    }

    async fn append_summary(
        &self,
        parent: SessionId,
        summary: &Entry,
        child: SessionId,
    ) -> Result<(), StorageError> {
        (**self).append_summary(parent, summary, child).await
    }

    async fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), StorageError> {
        (**self).set_state(id, state).await
    }

    async fn load(&self, id: SessionId) -> Result<Option<StoredSession>, StorageError> {
        (**self).load(id).await
    }

    async fn list(&self) -> Result<Vec<SessionMeta>, StorageError> {
        (**self).list().await
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        (**self).remove(id).await
    }
}

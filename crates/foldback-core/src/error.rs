//! Core error taxonomy.

use thiserror::Error;

use crate::{checkpoint::CheckpointId, traits::SessionId};

/// Recoverable failures of log, registry and revert operations.
///
/// None of these leave the targeted session changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("No such checkpoint: {0}")]
    UnknownCheckpoint(CheckpointId),
    #[error("Invalid log position: {0}")]
    InvalidPosition(i64),
    #[error("Invalid fold content: {0}")]
    InvalidFoldContent(String),
    #[error("Session {0} was detached and accepts no further writes")]
    DetachedSessionWrite(SessionId),
    #[error("Session {0} is completed and accepts no further writes")]
    SessionCompleted(SessionId),
    #[error("Role {0} is reserved for entries inserted by the core")]
    ReservedRole(crate::entry::Role),
    #[error("A revert is already staged for session {0}")]
    RevertAlreadyPending(SessionId),
}

impl CoreError {
    /// Stable snake_case code used on the wire.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownCheckpoint(_) => "unknown_checkpoint",
            Self::InvalidPosition(_) => "invalid_position",
            Self::InvalidFoldContent(_) => "invalid_fold_content",
            Self::DetachedSessionWrite(_) => "detached_session_write",
            Self::SessionCompleted(_) => "session_completed",
            Self::ReservedRole(_) => "reserved_role",
            Self::RevertAlreadyPending(_) => "revert_already_pending",
        }
    }
}

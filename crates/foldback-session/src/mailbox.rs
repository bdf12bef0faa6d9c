//! Staged reverts.
//!
//! A tool running inside a step cannot rewrite the log it is being recorded
//! into. It stages the revert here instead, and the driver applies it once
//! the step has ended. At most one revert can be staged per session.

use bytes::Bytes;
use foldback_core::{CheckpointId, CheckpointRegistry, CoreError, SessionId};

/// A revert request: the checkpoint to return to and the fold to leave there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertRequest {
    pub checkpoint_id: CheckpointId,
    pub folded_message: Bytes,
}

impl RevertRequest {
    #[must_use]
    pub fn new(checkpoint_id: impl Into<CheckpointId>, folded_message: impl Into<Bytes>) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            folded_message: folded_message.into(),
        }
    }
}

/// Holds at most one staged revert for a session.
#[derive(Debug, Default)]
pub struct RevertMailbox {
    pending: Option<RevertRequest>,
}

impl RevertMailbox {
    /// Stage `request` for later application.
    ///
    /// # Errors
    /// [`CoreError::RevertAlreadyPending`] if a revert is already staged,
    /// [`CoreError::UnknownCheckpoint`] if the checkpoint does not currently
    /// resolve in `registry`.
    pub fn stage(
        &mut self,
        session: SessionId,
        request: RevertRequest,
        registry: &CheckpointRegistry,
    ) -> Result<(), CoreError> {
        if self.pending.is_some() {
            return Err(CoreError::RevertAlreadyPending(session));
        }
        registry.resolve(request.checkpoint_id)?;
        self.pending = Some(request);
        Ok(())
    }

    /// Take the staged revert, leaving the mailbox empty.
    pub fn take(&mut self) -> Option<RevertRequest> {
        self.pending.take()
    }

    #[must_use]
    pub const fn pending(&self) -> Option<&RevertRequest> {
        self.pending.as_ref()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

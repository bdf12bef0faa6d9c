//! Revert engine: cut a session's log at a checkpoint and fold what came
//! after into one agent-authored entry.
//!
//! A revert runs in two phases. [`RevertEngine::prepare`] validates
//! everything and computes a [`RevertPlan`] without touching the session;
//! [`RevertEngine::apply`] carries the plan out and cannot fail. A failed
//! revert therefore never leaves a partially rewritten log behind.

use foldback_core::{
    CheckpointId, CoreError, EngineConfig, Entry, NewEntry, Sequence, SessionId,
};

use crate::{mailbox::RevertRequest, session::Session};

/// Everything a revert will do, computed up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertPlan {
    pub checkpoint_id: CheckpointId,
    /// Sequence of the checkpoint's marker entry.
    pub position: Sequence,
    /// The fold entry as it will be appended.
    pub fold: Entry,
    /// Linked children spawned after the checkpoint.
    pub detach: Vec<SessionId>,
    /// Checkpoints registered after the checkpoint.
    pub invalidate: Vec<CheckpointId>,
    cut: i64,
}

/// What a successful revert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertOutcome {
    pub checkpoint_id: CheckpointId,
    pub position: Sequence,
    pub fold_sequence: Sequence,
    /// Number of entries removed from the log.
    pub discarded: usize,
    pub invalidated: Vec<CheckpointId>,
    pub detached: Vec<SessionId>,
}

/// Validates and applies reverts.
#[derive(Debug, Clone)]
pub struct RevertEngine {
    max_fold_bytes: usize,
}

impl Default for RevertEngine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RevertEngine {
    /// Create an engine accepting folds up to `max_fold_bytes`.
    #[must_use]
    pub const fn new(max_fold_bytes: usize) -> Self {
        Self { max_fold_bytes }
    }

    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_fold_bytes)
    }

    /// Check that `content` is an acceptable fold.
    ///
    /// # Errors
    /// [`CoreError::InvalidFoldContent`] when the content is empty, only
    /// whitespace, not UTF-8, or larger than the configured limit.
    pub fn validate_fold(&self, content: &[u8]) -> Result<(), CoreError> {
        if content.len() > self.max_fold_bytes {
            return Err(CoreError::InvalidFoldContent(format!(
                "fold is {} bytes, limit is {}",
                content.len(),
                self.max_fold_bytes
            )));
        }
        let text = std::str::from_utf8(content)
            .map_err(|e| CoreError::InvalidFoldContent(format!("fold is not UTF-8: {e}")))?;
        if text.trim().is_empty() {
            return Err(CoreError::InvalidFoldContent("fold is empty".into()));
        }
        Ok(())
    }

    /// Validate `request` against `session` and compute the plan.
    ///
    /// # Errors
    /// Fails if the session is not writable, the checkpoint does not
    /// resolve, or the fold is invalid. The session is left untouched.
    pub fn prepare(&self, session: &Session, request: &RevertRequest) -> Result<RevertPlan, CoreError> {
        session.ensure_writable()?;
        let position = session.checkpoints().resolve(request.checkpoint_id)?;
        self.validate_fold(&request.folded_message)?;
        let cut = i64::try_from(position).map_err(|_| CoreError::InvalidPosition(i64::MAX))?;

        Ok(RevertPlan {
            checkpoint_id: request.checkpoint_id,
            position,
            fold: session
                .log()
                .preview(&NewEntry::agent(request.folded_message.clone())),
            detach: session.children_spawned_after(position),
            invalidate: session.checkpoints().positioned_after(position),
            cut,
        })
    }

    /// Carry out a prepared plan.
    ///
    /// Order: truncate, detach children, invalidate checkpoints, append the
    /// fold. The plan must come from [`Self::prepare`] on the same session
    /// with no mutation in between.
    pub fn apply(session: &mut Session, plan: RevertPlan) -> RevertOutcome {
        // `cut` is non-negative by construction, so truncation cannot fail.
        let discarded = session.log_mut().truncate_after(plan.cut).unwrap_or_default();

        for child in &plan.detach {
            session.unlink_child(*child);
        }

        let invalidated = session.checkpoints_mut().invalidate_after(plan.position);
        debug_assert_eq!(invalidated, plan.invalidate);
        session.mailbox_mut().clear();

        let fold_sequence = session.log_mut().append(NewEntry {
            role: plan.fold.role,
            content: plan.fold.content,
        });
        debug_assert_eq!(fold_sequence, plan.fold.sequence);

        RevertOutcome {
            checkpoint_id: plan.checkpoint_id,
            position: plan.position,
            fold_sequence,
            discarded,
            invalidated,
            detached: plan.detach,
        }
    }

    /// Prepare and apply in one go.
    ///
    /// Only unlinks detached children; moving them to the terminated state
    /// is up to the owner of the session tree.
    ///
    /// # Errors
    /// See [`Self::prepare`].
    pub fn revert(&self, session: &mut Session, request: &RevertRequest) -> Result<RevertOutcome, CoreError> {
        let plan = self.prepare(session, request)?;
        Ok(Self::apply(session, plan))
    }
}

#[cfg(test)]
mod tests {
    use foldback_core::{Role, SessionMeta};
    use uuid::Uuid;

    use super::*;

    fn session_with_checkpoint_at_3() -> (Session, CheckpointId) {
        let mut session = Session::new(SessionMeta::root(Uuid::new_v4(), 0));
        session.append(NewEntry::user("fix the bug")).unwrap();
        session.append(NewEntry::tool_call("read big file")).unwrap();
        let cp = session.insert_checkpoint().unwrap();
        session.append(NewEntry::tool_result("20k lines")).unwrap();
        session.append(NewEntry::agent("found it")).unwrap();
        assert_eq!(cp.position, 3);
        (session, cp.id)
    }

    fn sequences(session: &Session) -> Vec<Sequence> {
        session.log().entries().iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_revert_folds_after_marker() {
        let (mut session, cp) = session_with_checkpoint_at_3();
        let engine = RevertEngine::default();

        let outcome = engine
            .revert(&mut session, &RevertRequest::new(cp, "fixed bug, no need to redo"))
            .unwrap();

        assert_eq!(sequences(&session), vec![1, 2, 3, 6]);
        assert_eq!(outcome.fold_sequence, 6);
        assert_eq!(outcome.discarded, 2);
        let fold = session.log().get(6).unwrap();
        assert_eq!(fold.role, Role::Agent);
        assert_eq!(fold.text(), Some("fixed bug, no need to redo"));
        assert!(session.checkpoints().resolve(cp).is_ok());
    }

    #[test]
    fn test_revert_twice_replaces_fold() {
        let (mut session, cp) = session_with_checkpoint_at_3();
        let engine = RevertEngine::default();

        engine.revert(&mut session, &RevertRequest::new(cp, "first")).unwrap();
        engine.revert(&mut session, &RevertRequest::new(cp, "second")).unwrap();

        assert_eq!(sequences(&session), vec![1, 2, 3, 7]);
        assert_eq!(session.log().get(7).and_then(Entry::text), Some("second"));
    }

    #[test]
    fn test_invalid_fold_leaves_log_untouched() {
        let (mut session, cp) = session_with_checkpoint_at_3();
        let before = session.snapshot();
        let engine = RevertEngine::new(16);

        for bad in [&b""[..], b"   \n\t", b"\xff\xfe", b"this fold is far too long"] {
            let err = engine
                .revert(&mut session, &RevertRequest::new(cp, bad.to_vec()))
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidFoldContent(_)));
        }
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_unknown_checkpoint_leaves_log_untouched() {
        let (mut session, _) = session_with_checkpoint_at_3();
        let before = session.snapshot();
        let err = RevertEngine::default()
            .revert(&mut session, &RevertRequest::new(CheckpointId(99), "fold"))
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownCheckpoint(CheckpointId(99)));
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_later_checkpoints_are_invalidated() {
        let (mut session, early) = session_with_checkpoint_at_3();
        let late = session.insert_checkpoint().unwrap().id;
        let engine = RevertEngine::default();

        let outcome = engine
            .revert(&mut session, &RevertRequest::new(early, "fold"))
            .unwrap();
        assert_eq!(outcome.invalidated, vec![late]);

        let err = engine
            .revert(&mut session, &RevertRequest::new(late, "again"))
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownCheckpoint(late));

        let fresh = session.insert_checkpoint().unwrap().id;
        assert_ne!(fresh, late);
        assert!(fresh > late);
    }

    #[test]
    fn test_plan_lists_children_to_detach() {
        let (mut session, cp) = session_with_checkpoint_at_3();
        let before = Uuid::new_v4();
        let after = Uuid::new_v4();
        session.link_child(before, 2);
        session.link_child(after, 5);

        let plan = RevertEngine::default()
            .prepare(&session, &RevertRequest::new(cp, "fold"))
            .unwrap();
        assert_eq!(plan.detach, vec![after]);

        let outcome = RevertEngine::apply(&mut session, plan);
        assert_eq!(outcome.detached, vec![after]);
        assert_eq!(session.children(), vec![before]);
    }
}

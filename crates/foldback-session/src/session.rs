//! A single agent session: one log, one checkpoint registry, linked children.

use std::collections::BTreeMap;

use foldback_core::{
    Checkpoint, CheckpointId, CheckpointRegistry, CoreError, Entry, MessageLog, NewEntry, Role,
    Sequence, SessionId, SessionMeta, SessionState, StoredSession,
};

use crate::mailbox::{RevertMailbox, RevertRequest};

/// One node of the session tree.
///
/// A session never owns its parent; it only remembers the parent's id.
/// `children` holds the *linked* children (still active) together with the
/// parent position they were spawned at.
#[derive(Debug)]
pub struct Session {
    meta: SessionMeta,
    children: BTreeMap<SessionId, Sequence>,
    log: MessageLog,
    checkpoints: CheckpointRegistry,
    mailbox: RevertMailbox,
}

/// Point-in-time copy of a session, for queries and transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub meta: SessionMeta,
    pub children: Vec<SessionId>,
    pub entries: Vec<Entry>,
    pub checkpoints: Vec<Checkpoint>,
    pub next_sequence: Sequence,
    pub checkpoints_issued: u64,
    pub staged_revert: Option<CheckpointId>,
}

impl Session {
    /// Create a session from its metadata.
    #[must_use]
    pub fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            children: BTreeMap::new(),
            log: MessageLog::new(),
            checkpoints: CheckpointRegistry::new(),
            mailbox: RevertMailbox::default(),
        }
    }

    /// Rebuild a session from storage. Children are linked by the caller.
    #[must_use]
    pub fn from_stored(stored: StoredSession) -> Self {
        Self {
            meta: stored.meta,
            children: BTreeMap::new(),
            log: MessageLog::from_parts(stored.next_sequence, stored.entries),
            checkpoints: CheckpointRegistry::from_parts(
                stored.checkpoints_issued,
                stored.checkpoints,
            ),
            mailbox: RevertMailbox::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.meta.id
    }

    #[must_use]
    pub const fn parent(&self) -> Option<SessionId> {
        self.meta.parent
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.meta.state
    }

    #[must_use]
    pub const fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    #[must_use]
    pub const fn log(&self) -> &MessageLog {
        &self.log
    }

    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointRegistry {
        &self.checkpoints
    }

    #[must_use]
    pub const fn mailbox(&self) -> &RevertMailbox {
        &self.mailbox
    }

    pub(crate) fn mailbox_mut(&mut self) -> &mut RevertMailbox {
        &mut self.mailbox
    }

    pub(crate) fn log_mut(&mut self) -> &mut MessageLog {
        &mut self.log
    }

    pub(crate) fn checkpoints_mut(&mut self) -> &mut CheckpointRegistry {
        &mut self.checkpoints
    }

    /// Ids of linked children in ascending id order.
    #[must_use]
    pub fn children(&self) -> Vec<SessionId> {
        self.children.keys().copied().collect()
    }

    /// Whether `child` is currently linked to this session.
    #[must_use]
    pub fn has_child(&self, child: SessionId) -> bool {
        self.children.contains_key(&child)
    }

    /// Linked children spawned after `position`, i.e. with a spawn point
    /// past it.
    #[must_use]
    pub fn children_spawned_after(&self, position: Sequence) -> Vec<SessionId> {
        self.children
            .iter()
            .filter(|&(_, &spawn_point)| spawn_point > position)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Fail unless the session still accepts writes.
    ///
    /// # Errors
    /// [`CoreError::DetachedSessionWrite`] for terminated sessions,
    /// [`CoreError::SessionCompleted`] for completed ones.
    pub fn ensure_writable(&self) -> Result<(), CoreError> {
        match self.meta.state {
            SessionState::Active => Ok(()),
            SessionState::Terminated => Err(CoreError::DetachedSessionWrite(self.meta.id)),
            SessionState::Completed => Err(CoreError::SessionCompleted(self.meta.id)),
        }
    }

    /// The entry an append of `entry` would produce.
    ///
    /// # Errors
    /// Fails if the session is not writable or the role is reserved.
    pub fn preview_append(&self, entry: &NewEntry) -> Result<Entry, CoreError> {
        self.ensure_writable()?;
        if entry.role == Role::SystemMarker {
            return Err(CoreError::ReservedRole(entry.role));
        }
        Ok(self.log.preview(entry))
    }

    /// Append a planner-authored entry.
    ///
    /// # Errors
    /// Fails if the session is not writable or the role is reserved.
    pub fn append(&mut self, entry: NewEntry) -> Result<Sequence, CoreError> {
        self.preview_append(&entry)?;
        Ok(self.log.append(entry))
    }

    /// The marker and checkpoint [`Self::insert_checkpoint`] would produce.
    ///
    /// # Errors
    /// Fails if the session is not writable.
    pub fn preview_checkpoint(&self) -> Result<(Entry, Checkpoint), CoreError> {
        self.ensure_writable()?;
        let id = self.checkpoints.next_id();
        let marker = self.log.preview_marker(id);
        let checkpoint = Checkpoint {
            id,
            position: marker.sequence,
        };
        Ok((marker, checkpoint))
    }

    /// Append a system marker, then register it as a checkpoint.
    ///
    /// # Errors
    /// Fails if the session is not writable.
    pub fn insert_checkpoint(&mut self) -> Result<Checkpoint, CoreError> {
        self.ensure_writable()?;
        let id = self.checkpoints.next_id();
        let position = self.log.append_marker(id);
        let registered = self.checkpoints.register(position);
        debug_assert_eq!(registered, id);
        Ok(Checkpoint {
            id: registered,
            position,
        })
    }

    /// Stage a revert to be applied after the current step.
    ///
    /// # Errors
    /// Fails if the session is not writable, a revert is already staged, or
    /// the checkpoint does not resolve.
    pub fn stage_revert(&mut self, request: RevertRequest) -> Result<(), CoreError> {
        self.ensure_writable()?;
        self.mailbox.stage(self.meta.id, request, &self.checkpoints)
    }

    pub(crate) fn link_child(&mut self, child: SessionId, spawn_point: Sequence) {
        self.children.insert(child, spawn_point);
    }

    pub(crate) fn unlink_child(&mut self, child: SessionId) -> bool {
        self.children.remove(&child).is_some()
    }

    /// Move an active session into a terminal state.
    ///
    /// Returns false if the session was already terminal; terminal states
    /// are never left. A finished session keeps no child links.
    pub(crate) fn finish(&mut self, state: SessionState) -> bool {
        if self.meta.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.meta.state = state;
        self.mailbox.clear();
        self.children.clear();
        true
    }

    /// Copy out the session's current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            meta: self.meta.clone(),
            children: self.children(),
            entries: self.log.entries().to_vec(),
            checkpoints: self.checkpoints.valid(),
            next_sequence: self.log.next_sequence(),
            checkpoints_issued: self.checkpoints.issued(),
            staged_revert: self.mailbox.pending().map(|r| r.checkpoint_id),
        }
    }
}

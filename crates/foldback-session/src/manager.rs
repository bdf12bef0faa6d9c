//! Session manager: the session tree, its locking and its persistence.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use foldback_core::{
    Checkpoint, CheckpointId, CoreError, EngineConfig, Entry, EventStore, NewEntry, Role,
    Sequence, SessionEvent, SessionId, SessionMeta, SessionState, SessionStorage, StorageError,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    mailbox::RevertRequest,
    revert::{RevertEngine, RevertOutcome},
    session::{Session, SessionSnapshot},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session {0} has no parent")]
    NotAChild(SessionId),
    #[error("Session {0} has no agent entry to summarize")]
    MissingSummary(SessionId),
}

impl ManagerError {
    /// Stable snake_case code reported to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.code(),
            Self::Storage(_) => "storage_error",
            Self::NotFound(_) => "session_not_found",
            Self::NotAChild(_) => "not_a_child",
            Self::MissingSummary(_) => "missing_summary",
        }
    }
}

/// One arena slot. The parent id never changes, so it lives outside the lock.
struct SessionSlot {
    parent: Option<SessionId>,
    session: Mutex<Session>,
}

impl SessionSlot {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            parent: session.parent(),
            session: Mutex::new(session),
        })
    }
}

/// Finish every active session that its parent unlinked, or whose parent is
/// already terminal, until nothing changes. Returns the settled sessions.
fn settle(
    sessions: &mut HashMap<SessionId, Session>,
    unlinked: &HashMap<SessionId, SessionState>,
) -> Vec<(SessionId, SessionState)> {
    let mut settled = Vec::new();
    loop {
        let pending: Vec<_> = sessions
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .filter_map(|s| {
                if let Some(&state) = unlinked.get(&s.id()) {
                    return Some((s.id(), state));
                }
                let parent = sessions.get(&s.parent()?)?;
                parent
                    .state()
                    .is_terminal()
                    .then_some((s.id(), SessionState::Terminated))
            })
            .collect();
        if pending.is_empty() {
            return settled;
        }
        for (id, state) in pending {
            if let Some(session) = sessions.get_mut(&id) {
                session.finish(state);
            }
            settled.push((id, state));
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Owns every session and serializes mutations per session.
///
/// Sessions live in an arena keyed by id. The arena lock is only held to
/// look up or insert slots, never while waiting on a session lock. When an
/// operation touches several sessions it locks ancestors before
/// descendants.
pub struct SessionManager<S>
where
    S: SessionStorage,
{
    storage: S,
    engine: RevertEngine,
    events: Arc<EventStore>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl<S> SessionManager<S>
where
    S: SessionStorage,
{
    /// Create a manager with default configuration.
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, &EngineConfig::default())
    }

    /// Create an empty manager.
    #[must_use]
    pub fn with_config(storage: S, config: &EngineConfig) -> Self {
        Self {
            storage,
            engine: RevertEngine::from_config(config),
            events: Arc::new(EventStore::from_config(config)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a manager from everything in `storage`.
    ///
    /// Sessions a parent's journal records as detached or completed are
    /// settled into that terminal state, and so is every active descendant
    /// of a terminal session. The settled states are written back. Remaining
    /// active children are re-linked to their parents at their recorded
    /// spawn points. Staged reverts are not persisted and start out empty.
    ///
    /// # Errors
    /// Returns error if the storage cannot be listed or a session fails to load.
    pub async fn restore(storage: S, config: &EngineConfig) -> Result<Self, ManagerError> {
        let mut sessions = HashMap::new();
        let mut unlinked = HashMap::new();
        for meta in storage.list().await? {
            let stored = storage
                .load(meta.id)
                .await?
                .ok_or(ManagerError::NotFound(meta.id))?;
            unlinked.extend(stored.detached.iter().map(|&id| (id, SessionState::Terminated)));
            unlinked.extend(stored.completed.iter().map(|&id| (id, SessionState::Completed)));
            sessions.insert(meta.id, Session::from_stored(stored));
        }

        for (id, state) in settle(&mut sessions, &unlinked) {
            warn!("Restored session {id} settled as {state:?}");
            if let Err(e) = storage.set_state(id, state).await {
                tracing::error!("Failed to persist settled state of {id}: {e}");
            }
        }

        let links: Vec<_> = sessions
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .filter_map(|s| Some((s.parent()?, s.id(), s.meta().spawn_point?)))
            .collect();
        for (parent, child, spawn_point) in links {
            match sessions.get_mut(&parent) {
                Some(parent) => parent.link_child(child, spawn_point),
                None => warn!("Restored session {child} references missing parent {parent}"),
            }
        }

        info!("Restored {} sessions", sessions.len());
        let manager = Self::with_config(storage, config);
        *manager.sessions.write().await = sessions
            .into_iter()
            .map(|(id, session)| (id, SessionSlot::new(session)))
            .collect();
        Ok(manager)
    }

    /// Event store mirrored by transports.
    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    async fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, ManagerError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))
    }

    /// Create a new root session.
    ///
    /// # Errors
    /// Returns error if the session cannot be persisted.
    pub async fn create_root(&self) -> Result<SessionId, ManagerError> {
        let meta = SessionMeta::root(Uuid::new_v4(), now());
        let id = meta.id;
        self.storage.create(&meta).await?;
        self.sessions
            .write()
            .await
            .insert(id, SessionSlot::new(Session::new(meta)));

        info!("Created root session {id}");
        self.events.push(SessionEvent::SessionCreated { session: id });
        Ok(id)
    }

    /// Append a planner-authored entry.
    ///
    /// # Errors
    /// Returns error if the session is unknown or not writable, the role is
    /// reserved, or persistence fails.
    pub async fn append(&self, id: SessionId, entry: NewEntry) -> Result<Sequence, ManagerError> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;

        let preview = session.preview_append(&entry)?;
        self.storage.append_entry(id, &preview).await?;
        let sequence = session.append(entry)?;

        debug!("Appended {} entry {sequence} to {id}", preview.role);
        self.events.push(SessionEvent::appended(id, &preview));
        Ok(sequence)
    }

    /// Insert a checkpoint marker and register it.
    ///
    /// # Errors
    /// Returns error if the session is unknown or not writable, or
    /// persistence fails.
    pub async fn checkpoint(&self, id: SessionId) -> Result<Checkpoint, ManagerError> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;

        let (marker, preview) = session.preview_checkpoint()?;
        self.storage.append_checkpoint(id, &marker, preview).await?;
        let checkpoint = session.insert_checkpoint()?;

        debug!("Checkpoint {} at {} in {id}", checkpoint.id, checkpoint.position);
        self.events.extend([
            SessionEvent::appended(id, &marker),
            SessionEvent::CheckpointRegistered {
                session: id,
                checkpoint_id: checkpoint.id,
                sequence: checkpoint.position,
            },
        ]);
        Ok(checkpoint)
    }

    /// Spawn a child of `parent` at the parent's current position.
    ///
    /// # Errors
    /// Returns error if the parent is unknown or not writable, or
    /// persistence fails.
    pub async fn spawn_child(&self, parent: SessionId) -> Result<SessionId, ManagerError> {
        let slot = self.slot(parent).await?;
        let mut parent_session = slot.session.lock().await;
        parent_session.ensure_writable()?;

        let spawn_point = parent_session.log().next_sequence();
        let meta = SessionMeta::child(Uuid::new_v4(), parent, spawn_point, now());
        let child = meta.id;
        self.storage.create(&meta).await?;

        parent_session.link_child(child, spawn_point);
        self.sessions
            .write()
            .await
            .insert(child, SessionSlot::new(Session::new(meta)));

        info!("Spawned child {child} of {parent} at {spawn_point}");
        self.events.push(SessionEvent::ChildSpawned { parent, child });
        Ok(child)
    }

    /// Revert `id` to `checkpoint_id`, leaving `folded_message` as the fold.
    ///
    /// # Errors
    /// Returns error if the session is unknown or not writable, the
    /// checkpoint does not resolve, the fold is invalid, or persistence
    /// fails. On error nothing changes.
    pub async fn revert(
        &self,
        id: SessionId,
        checkpoint_id: CheckpointId,
        folded_message: impl Into<Bytes>,
    ) -> Result<RevertOutcome, ManagerError> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        self.revert_locked(&mut session, &RevertRequest::new(checkpoint_id, folded_message))
            .await
    }

    async fn revert_locked(
        &self,
        session: &mut Session,
        request: &RevertRequest,
    ) -> Result<RevertOutcome, ManagerError> {
        let id = session.id();
        let plan = self.engine.prepare(session, request)?;
        self.storage
            .revert(id, plan.position, &plan.fold, &plan.detach)
            .await?;

        let mut terminated = Vec::new();
        for child in &plan.detach {
            terminated.extend(self.terminate_subtree(*child).await);
        }

        let fold = plan.fold.clone();
        let outcome = RevertEngine::apply(session, plan);

        info!(
            "Reverted {id} to checkpoint {} at {}: discarded {}, invalidated {:?}, detached {:?}",
            outcome.checkpoint_id,
            outcome.position,
            outcome.discarded,
            outcome.invalidated,
            outcome.detached
        );
        self.events.extend(
            terminated
                .into_iter()
                .map(|child| SessionEvent::ChildTerminated { child })
                .chain([
                    SessionEvent::Reverted {
                        session: id,
                        checkpoint_id: outcome.checkpoint_id,
                    },
                    SessionEvent::appended(id, &fold),
                ]),
        );
        Ok(outcome)
    }

    /// Mark `root` and all of its linked descendants terminated.
    ///
    /// Called with the detaching ancestor locked. A failed state write is
    /// logged and skipped; the in-memory state still moves, and the
    /// ancestor's journal lets `restore` settle it again.
    async fn terminate_subtree(&self, root: SessionId) -> Vec<SessionId> {
        let mut terminated = Vec::new();
        let mut pending = vec![root];

        while let Some(id) = pending.pop() {
            let Ok(slot) = self.slot(id).await else {
                warn!("Detached session {id} is not in the arena");
                continue;
            };
            let mut session = slot.session.lock().await;
            let descendants = session.children();
            if !session.finish(SessionState::Terminated) {
                continue;
            }
            if let Err(e) = self.storage.set_state(id, SessionState::Terminated).await {
                tracing::error!("Failed to persist termination of {id}: {e}");
            }
            warn!("Detached session {id}");
            terminated.push(id);
            pending.extend(descendants);
        }

        terminated
    }

    /// Stage a revert for [`Self::apply_staged_revert`].
    ///
    /// # Errors
    /// Returns error if the session is unknown or not writable, a revert is
    /// already staged, the checkpoint does not resolve or the fold is invalid.
    pub async fn stage_revert(
        &self,
        id: SessionId,
        checkpoint_id: CheckpointId,
        folded_message: impl Into<Bytes>,
    ) -> Result<(), ManagerError> {
        let request = RevertRequest::new(checkpoint_id, folded_message);
        self.engine.validate_fold(&request.folded_message)?;

        let slot = self.slot(id).await?;
        slot.session.lock().await.stage_revert(request)?;
        debug!("Staged revert of {id} to checkpoint {checkpoint_id}");
        Ok(())
    }

    /// Apply the staged revert, if any.
    ///
    /// # Errors
    /// Same as [`Self::revert`]. The staged request is consumed either way.
    pub async fn apply_staged_revert(
        &self,
        id: SessionId,
    ) -> Result<Option<RevertOutcome>, ManagerError> {
        let slot = self.slot(id).await?;
        let mut session = slot.session.lock().await;
        let Some(request) = session.mailbox_mut().take() else {
            return Ok(None);
        };
        self.revert_locked(&mut session, &request).await.map(Some)
    }

    /// Complete a child and deliver its summary to the parent.
    ///
    /// The summary is the child's last agent entry; it is appended to the
    /// parent as a tool result. Children the completed session still has
    /// linked can no longer report anywhere, so their subtrees are
    /// terminated. Returns the parent's new entry.
    ///
    /// # Errors
    /// Returns error if the session is unknown, is a root, is not active,
    /// has no agent entry, or persistence fails.
    pub async fn complete(&self, child: SessionId) -> Result<Entry, ManagerError> {
        let child_slot = self.slot(child).await?;
        let parent = child_slot.parent.ok_or(ManagerError::NotAChild(child))?;
        let parent_slot = self.slot(parent).await?;

        let mut parent_session = parent_slot.session.lock().await;
        let mut child_session = child_slot.session.lock().await;
        child_session.ensure_writable()?;
        if !parent_session.has_child(child) {
            return Err(CoreError::DetachedSessionWrite(child).into());
        }

        let summary = child_session
            .log()
            .last_with_role(Role::Agent)
            .map(|e| e.content.clone())
            .ok_or(ManagerError::MissingSummary(child))?;
        let entry = NewEntry::tool_result(summary.clone());
        let preview = parent_session.preview_append(&entry)?;

        self.storage.append_summary(parent, &preview, child).await?;
        if let Err(e) = self.storage.set_state(child, SessionState::Completed).await {
            tracing::error!("Failed to persist completion of {child}: {e}");
        }

        let orphans = child_session.children();
        parent_session.append(entry)?;
        parent_session.unlink_child(child);
        child_session.finish(SessionState::Completed);

        let mut terminated = Vec::new();
        for orphan in orphans {
            terminated.extend(self.terminate_subtree(orphan).await);
        }

        info!("Completed child {child} into {parent} at {}", preview.sequence);
        self.events.extend(
            terminated
                .into_iter()
                .map(|child| SessionEvent::ChildTerminated { child })
                .chain([
                    SessionEvent::appended(parent, &preview),
                    SessionEvent::ChildCompleted { child, summary },
                ]),
        );
        Ok(preview)
    }

    /// Remove `id` and every descendant, live or not, from the arena and
    /// storage. Returns the removed ids.
    ///
    /// # Errors
    /// Returns error if the session is unknown or storage removal fails.
    pub async fn destroy(&self, id: SessionId) -> Result<Vec<SessionId>, ManagerError> {
        let parent = self.slot(id).await?.parent;

        let mut doomed = vec![id];
        {
            let sessions = self.sessions.read().await;
            let mut i = 0;
            while i < doomed.len() {
                let current = doomed[i];
                doomed.extend(
                    sessions
                        .iter()
                        .filter(|(_, slot)| slot.parent == Some(current))
                        .map(|(&child, _)| child),
                );
                i += 1;
            }
        }

        if let Some(parent) = parent {
            if let Ok(slot) = self.slot(parent).await {
                slot.session.lock().await.unlink_child(id);
            }
        }

        for &doomed_id in doomed.iter().rev() {
            match self.storage.remove(doomed_id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.sessions.write().await.remove(&doomed_id);
        }

        info!("Destroyed {} sessions under {id}", doomed.len());
        Ok(doomed)
    }

    /// Live entries of `id` with `sequence >= from`.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn entries_from(&self, id: SessionId, from: Sequence) -> Result<Vec<Entry>, ManagerError> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.log().entries_from(from).to_vec())
    }

    /// Currently valid checkpoints of `id`, in position order.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn valid_checkpoints(&self, id: SessionId) -> Result<Vec<Checkpoint>, ManagerError> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.checkpoints().valid())
    }

    /// Linked children of `id`.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn children(&self, id: SessionId) -> Result<Vec<SessionId>, ManagerError> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await;
        Ok(session.children())
    }

    /// Lifecycle state of `id`.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn state(&self, id: SessionId) -> Result<SessionState, ManagerError> {
        let slot = self.slot(id).await?;
        let state = slot.session.lock().await.state();
        Ok(state)
    }

    /// Copy of `id`'s full state.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, ManagerError> {
        let slot = self.slot(id).await?;
        let snapshot = slot.session.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Metadata of every session in the arena, oldest first.
    pub async fn sessions(&self) -> Vec<SessionMeta> {
        let slots: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut metas = Vec::with_capacity(slots.len());
        for slot in slots {
            metas.push(slot.session.lock().await.meta().clone());
        }
        metas.sort_by_key(|m| (m.created_at, m.id));
        metas
    }
}

//! Session events mirrored to transports.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::CheckpointId,
    entry::{Entry, Role, Sequence},
    traits::SessionId,
};

/// A change to the session tree.
///
/// Replaying events in order rebuilds every session's live log: a
/// `reverted` event means "drop everything after the checkpoint's marker".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A root session was created.
    SessionCreated { session: SessionId },
    /// An entry was appended to a session's log.
    EntryAppended {
        session: SessionId,
        sequence: Sequence,
        role: Role,
        #[serde(with = "crate::content")]
        content: Bytes,
    },
    /// A marker entry was registered as a checkpoint.
    CheckpointRegistered {
        session: SessionId,
        checkpoint_id: CheckpointId,
        sequence: Sequence,
    },
    /// A session was reverted to a checkpoint.
    Reverted {
        session: SessionId,
        checkpoint_id: CheckpointId,
    },
    /// A sub-agent session was spawned.
    ChildSpawned { parent: SessionId, child: SessionId },
    /// A sub-agent finished and its summary was delivered upward.
    ChildCompleted {
        child: SessionId,
        #[serde(with = "crate::content")]
        summary: Bytes,
    },
    /// A sub-agent was orphaned by an ancestor revert.
    ChildTerminated { child: SessionId },
}

impl SessionEvent {
    /// Event for a freshly appended entry.
    #[must_use]
    pub fn appended(session: SessionId, entry: &Entry) -> Self {
        Self::EntryAppended {
            session,
            sequence: entry.sequence,
            role: entry.role,
            content: entry.content.clone(),
        }
    }

    /// Session the event is about.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        match self {
            Self::SessionCreated { session }
            | Self::EntryAppended { session, .. }
            | Self::CheckpointRegistered { session, .. }
            | Self::Reverted { session, .. } => *session,
            Self::ChildSpawned { parent, .. } => *parent,
            Self::ChildCompleted { child, .. } | Self::ChildTerminated { child } => *child,
        }
    }

    /// Whether the event concerns `session`. Spawns concern both ends.
    #[must_use]
    pub fn concerns(&self, session: SessionId) -> bool {
        match self {
            Self::ChildSpawned { parent, child } => *parent == session || *child == session,
            _ => self.session() == session,
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::EntryAppended { .. } => "entry_appended",
            Self::CheckpointRegistered { .. } => "checkpoint_registered",
            Self::Reverted { .. } => "reverted",
            Self::ChildSpawned { .. } => "child_spawned",
            Self::ChildCompleted { .. } => "child_completed",
            Self::ChildTerminated { .. } => "child_terminated",
        }
    }

    /// Approximate size, used to bound event history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = std::mem::size_of::<SessionEvent>();
        match self {
            Self::EntryAppended { content, .. } => OVERHEAD + content.len(),
            Self::ChildCompleted { summary, .. } => OVERHEAD + summary.len(),
            _ => OVERHEAD,
        }
    }

    /// Render as an SSE event named after the variant.
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize event: {e}");
            String::from("{}")
        });
        axum::response::sse::Event::default()
            .event(self.name())
            .data(data)
    }
}

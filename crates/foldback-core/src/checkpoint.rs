//! Checkpoint registry.
//!
//! Maps checkpoint ids to marker positions in the owning session's log.
//! Ids come from a per-session counter that never goes backwards, so an id
//! mentioned in folded history can never name a newer checkpoint.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{CoreError, entry::Sequence};

/// Identifier of a checkpoint, unique within one session for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CheckpointId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A currently valid checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub position: Sequence,
}

/// Per-session checkpoint registry.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRegistry {
    next_id: u64,
    valid: BTreeMap<CheckpointId, Sequence>,
}

impl CheckpointRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted state.
    ///
    /// `issued` is the number of ids ever minted; every valid id must be below it.
    #[must_use]
    pub fn from_parts(issued: u64, valid: impl IntoIterator<Item = Checkpoint>) -> Self {
        let valid: BTreeMap<_, _> = valid.into_iter().map(|c| (c.id, c.position)).collect();
        let floor = valid.keys().next_back().map_or(0, |id| id.0 + 1);
        Self {
            next_id: issued.max(floor),
            valid,
        }
    }

    /// The id the next [`Self::register`] call will return.
    #[must_use]
    pub const fn next_id(&self) -> CheckpointId {
        CheckpointId(self.next_id)
    }

    /// Mint a new id for the marker at `position`.
    pub fn register(&mut self, position: Sequence) -> CheckpointId {
        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        self.valid.insert(id, position);
        id
    }

    /// Position of a valid checkpoint.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownCheckpoint`] if `id` was never issued or has
    /// been invalidated.
    pub fn resolve(&self, id: CheckpointId) -> Result<Sequence, CoreError> {
        self.valid
            .get(&id)
            .copied()
            .ok_or(CoreError::UnknownCheckpoint(id))
    }

    /// Drop every checkpoint positioned strictly after `position`.
    ///
    /// Returns the invalidated ids in ascending order.
    pub fn invalidate_after(&mut self, position: Sequence) -> Vec<CheckpointId> {
        let stale: Vec<CheckpointId> = self
            .valid
            .iter()
            .filter(|&(_, &pos)| pos > position)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            self.valid.remove(id);
        }
        stale
    }

    /// Ids that would be dropped by [`Self::invalidate_after`].
    #[must_use]
    pub fn positioned_after(&self, position: Sequence) -> Vec<CheckpointId> {
        self.valid
            .iter()
            .filter(|&(_, &pos)| pos > position)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Valid checkpoints ordered by position.
    #[must_use]
    pub fn valid(&self) -> Vec<Checkpoint> {
        let mut all: Vec<Checkpoint> = self
            .valid
            .iter()
            .map(|(&id, &position)| Checkpoint { id, position })
            .collect();
        all.sort_by_key(|c| c.position);
        all
    }

    /// Number of ids ever issued.
    #[must_use]
    pub const fn issued(&self) -> u64 {
        self.next_id
    }

    /// Whether no checkpoint is currently valid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}

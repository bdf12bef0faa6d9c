//! Append-only message log with a never-rewinding sequence watermark.

use bytes::Bytes;

use crate::{
    CoreError,
    checkpoint::CheckpointId,
    entry::{Entry, NewEntry, Role, Sequence, checkpoint_marker_text},
};

/// Ordered entries of one session.
///
/// The only mutations are [`MessageLog::append`] (and its marker variant)
/// and [`MessageLog::truncate_after`]. Truncation removes entries from view
/// but leaves `next_sequence` untouched.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: Vec<Entry>,
    next_sequence: Sequence,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Create an empty log. The first entry gets sequence 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Rebuild a log from persisted entries.
    ///
    /// Entries are sorted by sequence; the watermark is raised past the last
    /// entry if the stored one lags behind.
    #[must_use]
    pub fn from_parts(next_sequence: Sequence, mut entries: Vec<Entry>) -> Self {
        entries.sort_by_key(|e| e.sequence);
        entries.dedup_by_key(|e| e.sequence);
        let floor = entries.last().map_or(1, |e| e.sequence + 1);
        Self {
            entries,
            next_sequence: next_sequence.max(floor),
        }
    }

    /// Append an entry and return its sequence.
    pub fn append(&mut self, entry: NewEntry) -> Sequence {
        let entry = self.preview(&entry);
        self.push(entry)
    }

    /// Append a checkpoint marker carrying `id`.
    pub fn append_marker(&mut self, id: CheckpointId) -> Sequence {
        let marker = self.preview_marker(id);
        self.push(marker)
    }

    /// The entry [`Self::append`] would create, without appending it.
    ///
    /// Lets a caller holding exclusive access persist an entry before it
    /// becomes visible.
    #[must_use]
    pub fn preview(&self, entry: &NewEntry) -> Entry {
        Entry {
            sequence: self.next_sequence,
            role: entry.role,
            content: entry.content.clone(),
            checkpoint: None,
        }
    }

    /// The marker [`Self::append_marker`] would create.
    #[must_use]
    pub fn preview_marker(&self, id: CheckpointId) -> Entry {
        Entry {
            sequence: self.next_sequence,
            role: Role::SystemMarker,
            content: Bytes::from(checkpoint_marker_text(id)),
            checkpoint: Some(id),
        }
    }

    fn push(&mut self, entry: Entry) -> Sequence {
        let sequence = entry.sequence;
        self.next_sequence = sequence + 1;
        self.entries.push(entry);
        sequence
    }

    /// Entries with `sequence >= position`, in order.
    #[must_use]
    pub fn entries_from(&self, position: Sequence) -> &[Entry] {
        let start = self.entries.partition_point(|e| e.sequence < position);
        &self.entries[start..]
    }

    /// All live entries.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Remove every entry with `sequence > position`.
    ///
    /// Truncating at or past the last entry is a no-op. Returns the number of
    /// removed entries.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidPosition`] for negative positions.
    pub fn truncate_after(&mut self, position: i64) -> Result<usize, CoreError> {
        let position =
            Sequence::try_from(position).map_err(|_| CoreError::InvalidPosition(position))?;
        let keep = self.entries.partition_point(|e| e.sequence <= position);
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        Ok(removed)
    }

    /// Look up a live entry.
    #[must_use]
    pub fn get(&self, sequence: Sequence) -> Option<&Entry> {
        self.entries
            .binary_search_by_key(&sequence, |e| e.sequence)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Most recent live entry authored with `role`.
    #[must_use]
    pub fn last_with_role(&self, role: Role) -> Option<&Entry> {
        self.entries.iter().rev().find(|e| e.role == role)
    }

    /// Sequence of the last live entry, or 0 when empty.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.entries.last().map_or(0, |e| e.sequence)
    }

    /// Sequence the next appended entry will receive.
    #[must_use]
    pub const fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

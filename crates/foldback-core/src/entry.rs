//! Message log entries.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;

/// Position of an entry inside one session's log.
///
/// Sequences start at 1 and are never reused, so `0` means "before the
/// first entry".
pub type Sequence = u64;

/// Author of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Input from the human user.
    User,
    /// Output authored by the agent, including folded summaries.
    Agent,
    /// A tool invocation issued by the agent.
    ToolCall,
    /// The result of a tool invocation or a completed sub-agent.
    ToolResult,
    /// A marker inserted by the core. Carries exactly one checkpoint id.
    SystemMarker,
}

impl Role {
    /// Stable wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::SystemMarker => "system_marker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, appended log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Assigned at append time.
    pub sequence: Sequence,
    /// Who authored the entry.
    pub role: Role,
    /// Opaque payload, never parsed by the core.
    pub content: Bytes,
    /// Set only on system markers.
    pub checkpoint: Option<CheckpointId>,
}

impl Entry {
    /// Whether this entry is a checkpoint marker.
    #[must_use]
    pub const fn is_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Approximate heap size, used to bound event history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.content.len() + std::mem::size_of::<Self>()
    }

    /// Content as text, if it is valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// An entry before it has been given a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub role: Role,
    pub content: Bytes,
}

impl NewEntry {
    /// Create a new entry.
    #[must_use]
    pub fn new(role: Role, content: impl Into<Bytes>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// User input.
    #[must_use]
    pub fn user(content: impl Into<Bytes>) -> Self {
        Self::new(Role::User, content)
    }

    /// Agent output.
    #[must_use]
    pub fn agent(content: impl Into<Bytes>) -> Self {
        Self::new(Role::Agent, content)
    }

    /// Tool invocation.
    #[must_use]
    pub fn tool_call(content: impl Into<Bytes>) -> Self {
        Self::new(Role::ToolCall, content)
    }

    /// Tool result.
    #[must_use]
    pub fn tool_result(content: impl Into<Bytes>) -> Self {
        Self::new(Role::ToolResult, content)
    }
}

/// Text of the marker entry for `id`.
#[must_use]
pub fn checkpoint_marker_text(id: CheckpointId) -> String {
    format!("CHECKPOINT {id}")
}

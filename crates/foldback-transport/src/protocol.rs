//! Wire protocol for client-server communication.
//!
//! JSON text frames. Entry content and folds travel as base64 so arbitrary
//! bytes survive unchanged.

use bytes::Bytes;
use foldback_core::{
    Checkpoint, CheckpointId, Entry, Role, Sequence, SessionEvent, SessionId, SessionMeta,
    SessionState,
};
use foldback_session::{RevertOutcome, SessionSnapshot};
use serde::{Deserialize, Serialize};

/// Client-chosen correlation id echoed in the response.
pub type RequestId = u64;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: Request,
}

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Create a root session.
    CreateRoot,
    /// Append a planner-authored entry.
    Append {
        session_id: SessionId,
        role: Role,
        #[serde(with = "foldback_core::content")]
        content: Bytes,
    },
    /// Insert a checkpoint marker.
    Checkpoint { session_id: SessionId },
    /// Spawn a child session.
    SpawnChild { session_id: SessionId },
    /// Revert to a checkpoint, leaving a fold.
    Revert {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
        #[serde(with = "foldback_core::content")]
        folded_message: Bytes,
    },
    /// Stage a revert to apply after the current step.
    StageRevert {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
        #[serde(with = "foldback_core::content")]
        folded_message: Bytes,
    },
    /// Apply the staged revert, if any.
    ApplyStagedRevert { session_id: SessionId },
    /// Complete a child and deliver its summary.
    Complete { session_id: SessionId },
    /// Read entries with `sequence >= from`.
    GetLog {
        session_id: SessionId,
        #[serde(default)]
        from: Sequence,
    },
    /// Full state of one session.
    Snapshot { session_id: SessionId },
    /// Metadata of every session.
    ListSessions,
    /// Start receiving events, optionally for one session only.
    Subscribe {
        #[serde(default)]
        session_id: Option<SessionId>,
        /// Replay retained history before live events.
        #[serde(default)]
        replay: bool,
    },
    /// Keepalive.
    Ping,
}

impl ClientMessage {
    #[must_use]
    pub const fn new(request_id: RequestId, request: Request) -> Self {
        Self {
            request_id,
            request,
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of one request.
    Response {
        request_id: RequestId,
        result: Outcome,
    },
    /// A session event, after `subscribe`.
    Event {
        #[serde(flatten)]
        event: SessionEvent,
    },
    /// Reply to `ping`.
    Pong { request_id: RequestId },
    /// A frame that could not be parsed.
    Error { code: String, message: String },
}

impl ServerMessage {
    #[must_use]
    pub const fn ok(request_id: RequestId, payload: Payload) -> Self {
        Self::Response {
            request_id,
            result: Outcome::Ok(payload),
        }
    }

    #[must_use]
    pub fn error(request_id: RequestId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Response {
            request_id,
            result: Outcome::Error(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Request id this message answers, if any.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Response { request_id, .. } | Self::Pong { request_id } => Some(*request_id),
            Self::Event { .. } | Self::Error { .. } => None,
        }
    }
}

/// `ok` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Payload),
    Error(ErrorBody),
}

/// Error reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable snake_case code, e.g. `unknown_checkpoint`.
    pub code: String,
    pub message: String,
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Created { session_id: SessionId },
    Appended { sequence: Sequence },
    Checkpoint { checkpoint_id: CheckpointId, sequence: Sequence },
    Spawned { child_id: SessionId },
    Reverted(RevertSummary),
    Staged,
    StagedApplied { outcome: Option<RevertSummary> },
    Completed { entry: WireEntry },
    Log { entries: Vec<WireEntry> },
    Snapshot(WireSnapshot),
    Sessions { sessions: Vec<SessionMeta> },
    Subscribed,
}

/// A log entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub sequence: Sequence,
    pub role: Role,
    #[serde(with = "foldback_core::content")]
    pub content: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl From<&Entry> for WireEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            sequence: entry.sequence,
            role: entry.role,
            content: entry.content.clone(),
            checkpoint_id: entry.checkpoint,
        }
    }
}

/// What a revert did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertSummary {
    pub checkpoint_id: CheckpointId,
    pub position: Sequence,
    pub fold_sequence: Sequence,
    pub discarded: usize,
    pub invalidated: Vec<CheckpointId>,
    pub detached: Vec<SessionId>,
}

impl From<RevertOutcome> for RevertSummary {
    fn from(outcome: RevertOutcome) -> Self {
        Self {
            checkpoint_id: outcome.checkpoint_id,
            position: outcome.position,
            fold_sequence: outcome.fold_sequence,
            discarded: outcome.discarded,
            invalidated: outcome.invalidated,
            detached: outcome.detached,
        }
    }
}

/// Full state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSnapshot {
    pub session_id: SessionId,
    pub parent: Option<SessionId>,
    pub spawn_point: Option<Sequence>,
    pub state: SessionState,
    pub children: Vec<SessionId>,
    pub entries: Vec<WireEntry>,
    pub checkpoints: Vec<Checkpoint>,
    pub next_sequence: Sequence,
    pub checkpoints_issued: u64,
    pub staged_revert: Option<CheckpointId>,
}

impl From<SessionSnapshot> for WireSnapshot {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.meta.id,
            parent: snapshot.meta.parent,
            spawn_point: snapshot.meta.spawn_point,
            state: snapshot.meta.state,
            children: snapshot.children,
            entries: snapshot.entries.iter().map(WireEntry::from).collect(),
            checkpoints: snapshot.checkpoints,
            next_sequence: snapshot.next_sequence,
            checkpoints_issued: snapshot.checkpoints_issued,
            staged_revert: snapshot.staged_revert,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_request_shape() {
        let session_id = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"revert","request_id":7,"session_id":"{session_id}","checkpoint_id":0,"folded_message":"Zml4ZWQ="}}"#
        );
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::new(
                7,
                Request::Revert {
                    session_id,
                    checkpoint_id: CheckpointId(0),
                    folded_message: Bytes::from_static(b"fixed"),
                }
            )
        );
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","request_id":1}"#).unwrap();
        assert_eq!(
            parsed.request,
            Request::Subscribe {
                session_id: None,
                replay: false
            }
        );
    }

    #[test]
    fn test_error_response_shape() {
        let msg = ServerMessage::error(3, "unknown_checkpoint", "Unknown checkpoint: 4");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["request_id"], 3);
        assert_eq!(value["result"]["error"]["code"], "unknown_checkpoint");
    }

    #[test]
    fn test_event_is_flattened() {
        let session = Uuid::new_v4();
        let msg = ServerMessage::Event {
            event: SessionEvent::Reverted {
                session,
                checkpoint_id: CheckpointId(2),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""event":"reverted""#));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.request_id(), None);
    }

    #[test]
    fn test_binary_entry_on_the_wire() {
        let msg = ServerMessage::ok(
            1,
            Payload::Log {
                entries: vec![WireEntry {
                    sequence: 1,
                    role: Role::ToolResult,
                    content: Bytes::from_static(b"\x00\xff"),
                    checkpoint_id: None,
                }],
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""content":"AP8=""#));
        assert_eq!(serde_json::from_str::<ServerMessage>(&json).unwrap(), msg);
    }
}

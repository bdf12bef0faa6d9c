//! JSONL journal storage.
//!
//! One `<session-id>.jsonl` file per session. The first line is a versioned
//! header; every later line is one journal record. Loading replays the
//! journal in order.
//!
//! ```text
//! {"type":"session","version":1,"id":"…","parent":null,"spawn_point":null,"created_at":1700000000}
//! {"type":"entry","sequence":1,"role":"user","content":"Zml4IHRoZSBidWc="}
//! {"type":"checkpoint","checkpoint_id":0,"sequence":2}
//! {"type":"summary","sequence":5,"role":"tool-result","content":"ZG9uZQ==","child":"…"}
//! {"type":"revert","position":2,"sequence":6,"role":"agent","content":"Zm9sZA==","detached":["…"]}
//! {"type":"state","state":"completed"}
//! ```

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use foldback_core::{
    Checkpoint, CheckpointId, Entry, Role, Sequence, SessionId, SessionMeta, SessionState,
    SessionStorage, StorageError, StoredSession, entry::checkpoint_marker_text,
};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

const JOURNAL_VERSION: u32 = 1;
const JOURNAL_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Session {
        version: u32,
        id: SessionId,
        parent: Option<SessionId>,
        spawn_point: Option<Sequence>,
        created_at: i64,
    },
    Entry {
        sequence: Sequence,
        role: Role,
        #[serde(with = "foldback_core::content")]
        content: Bytes,
    },
    Checkpoint {
        checkpoint_id: CheckpointId,
        sequence: Sequence,
    },
    Revert {
        position: Sequence,
        sequence: Sequence,
        role: Role,
        #[serde(with = "foldback_core::content")]
        content: Bytes,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        detached: Vec<SessionId>,
    },
    Summary {
        sequence: Sequence,
        role: Role,
        #[serde(with = "foldback_core::content")]
        content: Bytes,
        child: SessionId,
    },
    State {
        state: SessionState,
    },
}

impl Record {
    const fn header(meta: &SessionMeta) -> Self {
        Self::Session {
            version: JOURNAL_VERSION,
            id: meta.id,
            parent: meta.parent,
            spawn_point: meta.spawn_point,
            created_at: meta.created_at,
        }
    }
}

/// File-backed storage writing one append-only journal per session.
#[derive(Debug, Clone)]
pub struct JsonlStorage {
    root: PathBuf,
}

impl JsonlStorage {
    /// Open (and create if needed) a journal directory.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::io("creating journal directory", &root, source))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Journal file of session `id`.
    #[must_use]
    pub fn journal_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.{JOURNAL_EXTENSION}"))
    }

    async fn append_record(&self, id: SessionId, record: &Record) -> Result<(), StorageError> {
        let path = self.journal_path(id);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => StorageError::NotFound(id),
                _ => StorageError::io("opening journal for append", &path, source),
            })?;

        file.write_all(&encode_line(record)?)
            .await
            .map_err(|source| StorageError::io("appending to journal", &path, source))?;
        file.flush()
            .await
            .map_err(|source| StorageError::io("flushing journal", &path, source))?;
        Ok(())
    }
}

/// Prefix of a serialized state record. Records are written with the tag
/// first, so `list` can find the last state change without parsing
/// every line.
const STATE_PREFIX: &str = r#"{"type":"state""#;

fn encode_line(record: &Record) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse and check the header line of a journal.
fn parse_header<'a>(
    path: &Path,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<SessionMeta, StorageError> {
    let (line_number, first) = lines
        .next()
        .ok_or_else(|| StorageError::malformed(path, 1, "missing session header"))?;
    match parse_line(path, line_number, first)? {
        Record::Session {
            version,
            id,
            parent,
            spawn_point,
            created_at,
        } => {
            if version != JOURNAL_VERSION {
                return Err(StorageError::malformed(
                    path,
                    line_number,
                    format!("unsupported journal version {version}"),
                ));
            }
            Ok(SessionMeta {
                id,
                parent,
                spawn_point,
                state: SessionState::Active,
                created_at,
            })
        }
        _ => Err(StorageError::malformed(
            path,
            line_number,
            "first record is not a session header",
        )),
    }
}

fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line))
        .filter(|(_, line)| !line.trim().is_empty())
}

/// Header metadata plus the last recorded state, without replaying entries.
fn read_meta(path: &Path, text: &str) -> Result<SessionMeta, StorageError> {
    let mut lines = numbered_lines(text);
    let mut meta = parse_header(path, &mut lines)?;
    let last_state = lines
        .filter(|(_, line)| line.starts_with(STATE_PREFIX))
        .last();
    if let Some((line_number, line)) = last_state {
        if let Record::State { state } = parse_line(path, line_number, line)? {
            meta.state = state;
        }
    }
    Ok(meta)
}

/// Replay a journal into the session state it describes.
fn replay(path: &Path, text: &str) -> Result<StoredSession, StorageError> {
    let mut lines = numbered_lines(text);
    let mut stored = StoredSession::new(parse_header(path, &mut lines)?);

    for (line_number, line) in lines {
        let malformed = |message: String| StorageError::malformed(path, line_number, message);
        let ensure_fresh = |sequence: Sequence, next: Sequence| {
            if sequence < next {
                Err(malformed(format!(
                    "sequence {sequence} is behind watermark {next}"
                )))
            } else {
                Ok(())
            }
        };

        match parse_line(path, line_number, line)? {
            Record::Session { .. } => return Err(malformed("duplicate session header".into())),
            Record::Entry {
                sequence,
                role,
                content,
            } => {
                ensure_fresh(sequence, stored.next_sequence)?;
                stored.apply_entry(Entry {
                    sequence,
                    role,
                    content,
                    checkpoint: None,
                });
            }
            Record::Checkpoint {
                checkpoint_id,
                sequence,
            } => {
                ensure_fresh(sequence, stored.next_sequence)?;
                if checkpoint_id.0 < stored.checkpoints_issued {
                    return Err(malformed(format!("checkpoint id {checkpoint_id} reused")));
                }
                stored.apply_checkpoint(
                    Entry {
                        sequence,
                        role: Role::SystemMarker,
                        content: Bytes::from(checkpoint_marker_text(checkpoint_id)),
                        checkpoint: Some(checkpoint_id),
                    },
                    Checkpoint {
                        id: checkpoint_id,
                        position: sequence,
                    },
                );
            }
            Record::Revert {
                position,
                sequence,
                role,
                content,
                detached,
            } => {
                ensure_fresh(sequence, stored.next_sequence)?;
                if !stored.checkpoints.iter().any(|c| c.position == position) {
                    return Err(malformed(format!(
                        "revert to {position} does not match a valid checkpoint"
                    )));
                }
                stored.apply_revert(
                    position,
                    Entry {
                        sequence,
                        role,
                        content,
                        checkpoint: None,
                    },
                    &detached,
                );
            }
            Record::Summary {
                sequence,
                role,
                content,
                child,
            } => {
                ensure_fresh(sequence, stored.next_sequence)?;
                stored.apply_summary(
                    Entry {
                        sequence,
                        role,
                        content,
                        checkpoint: None,
                    },
                    child,
                );
            }
            Record::State { state } => stored.meta.state = state,
        }
    }

    Ok(stored)
}

fn parse_line(path: &Path, line_number: usize, line: &str) -> Result<Record, StorageError> {
    serde_json::from_str(line)
        .map_err(|e| StorageError::malformed(path, line_number, e.to_string()))
}

#[async_trait]
impl SessionStorage for JsonlStorage {
    async fn create(&self, meta: &SessionMeta) -> Result<(), StorageError> {
        let path = self.journal_path(meta.id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => StorageError::AlreadyExists(meta.id),
                _ => StorageError::io("creating journal", &path, source),
            })?;

        let mut lines = encode_line(&Record::header(meta))?;
        if meta.state != SessionState::Active {
            lines.extend(encode_line(&Record::State { state: meta.state })?);
        }
        file.write_all(&lines)
            .await
            .map_err(|source| StorageError::io("writing journal header", &path, source))?;
        file.flush()
            .await
            .map_err(|source| StorageError::io("flushing journal", &path, source))?;

        debug!("Created journal {}", path.display());
        Ok(())
    }

    async fn append_entry(&self, id: SessionId, entry: &Entry) -> Result<(), StorageError> {
        self.append_record(
            id,
            &Record::Entry {
                sequence: entry.sequence,
                role: entry.role,
                content: entry.content.clone(),
            },
        )
        .await
    }

    async fn append_checkpoint(
        &self,
        id: SessionId,
        marker: &Entry,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(marker.sequence, checkpoint.position);
        self.append_record(
            id,
            &Record::Checkpoint {
                checkpoint_id: checkpoint.id,
                sequence: checkpoint.position,
            },
        )
        .await
    }

    async fn revert(
        &self,
        id: SessionId,
        position: Sequence,
        fold: &Entry,
        detached: &[SessionId],
    ) -> Result<(), StorageError> {
        self.append_record(
            id,
            &Record::Revert {
                position,
                sequence: fold.sequence,
                role: fold.role,
                content: fold.content.clone(),
                detached: detached.to_vec(),
            },
        )
        .await
    }

    async fn append_summary(
        &self,
        parent: SessionId,
        summary: &Entry,
        child: SessionId,
    ) -> Result<(), StorageError> {
        self.append_record(
            parent,
            &Record::Summary {
                sequence: summary.sequence,
                role: summary.role,
                content: summary.content.clone(),
                child,
            },
        )
        .await
    }

    async fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), StorageError> {
        self.append_record(id, &Record::State { state }).await
    }

    async fn load(&self, id: SessionId) -> Result<Option<StoredSession>, StorageError> {
        let path = self.journal_path(id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::io("reading journal", &path, source)),
        };

        let stored = replay(&path, &text)?;
        if stored.meta.id != id {
            return Err(StorageError::malformed(
                &path,
                1,
                format!("header names session {}", stored.meta.id),
            ));
        }
        Ok(Some(stored))
    }

    async fn list(&self) -> Result<Vec<SessionMeta>, StorageError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|source| StorageError::io("listing journals", &self.root, source))?;

        let mut result = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|source| StorageError::io("listing journals", &self.root, source))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<SessionId>().ok())
            else {
                warn!("Skipping journal with non-session name {}", path.display());
                continue;
            };
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(StorageError::io("reading journal", &path, source)),
            };
            let meta = read_meta(&path, &text)?;
            if meta.id != id {
                return Err(StorageError::malformed(
                    &path,
                    1,
                    format!("header names session {}", meta.id),
                ));
            }
            result.push(meta);
        }

        result.sort_by_key(|m| (m.created_at, m.id));
        Ok(result)
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        let path = self.journal_path(id);
        fs::remove_file(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => StorageError::NotFound(id),
                _ => StorageError::io("removing journal", &path, source),
            })
    }
}

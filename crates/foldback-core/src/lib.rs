//! Core building blocks of the foldback checkpoint & revert engine.
//!
//! This crate provides:
//! - `MessageLog` - Append-only entries with a never-rewinding watermark
//! - `CheckpointRegistry` - Checkpoint ids mapped to marker positions
//! - `SessionEvent` / `EventStore` - Broadcast + history for mirrors
//! - `SessionStorage` - Trait for durable backends
//! - `EngineConfig` - Engine configuration

pub mod checkpoint;
pub mod config;
pub mod content;
pub mod entry;
pub mod error;
pub mod event;
pub mod event_store;
pub mod log;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointRegistry};
pub use config::{EngineConfig, StorageConfig};
pub use entry::{Entry, NewEntry, Role, Sequence};
pub use error::CoreError;
pub use event::SessionEvent;
pub use event_store::EventStore;
pub use log::MessageLog;
pub use traits::{SessionId, SessionMeta, SessionState, SessionStorage, StorageError, StoredSession};

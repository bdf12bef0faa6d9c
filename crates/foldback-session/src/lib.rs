//! Session tree, revert engine and storage backends for foldback.
//!
//! Provides:
//! - `SessionManager` - Owns the session arena and serializes mutations
//! - `RevertEngine` - Validates and applies checkpoint reverts
//! - `RevertMailbox` - Staged reverts applied after a step
//! - Storage implementations (memory, JSONL)

pub mod mailbox;
pub mod manager;
pub mod revert;
pub mod session;
pub mod storage;

pub use mailbox::{RevertMailbox, RevertRequest};
pub use manager::{ManagerError, SessionManager};
pub use revert::{RevertEngine, RevertOutcome, RevertPlan};
pub use session::{Session, SessionSnapshot};

//! Storage implementations.

#[cfg(feature = "jsonl")]
pub mod jsonl;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "jsonl")]
pub use jsonl::JsonlStorage;
#[cfg(feature = "memory")]
pub use memory::MemoryStorage;

use foldback_core::{SessionStorage, StorageConfig, StorageError};

/// Open the backend selected by `config`.
///
/// # Errors
/// Returns error if the backend cannot be opened or was compiled out.
#[allow(clippy::unused_async)]
pub async fn from_config(config: &StorageConfig) -> Result<Box<dyn SessionStorage>, StorageError> {
    match config {
        #[cfg(feature = "memory")]
        StorageConfig::Memory => Ok(Box::new(MemoryStorage::new())),
        #[cfg(feature = "jsonl")]
        StorageConfig::Jsonl { dir } => Ok(Box::new(JsonlStorage::open(dir).await?)),
        #[allow(unreachable_patterns)]
        other => Err(StorageError::Internal(format!(
            "storage backend {other:?} is not enabled in this build"
        ))),
    }
}

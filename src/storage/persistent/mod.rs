//! Persistent storage backend.
//!
//! A database is a directory holding:
//! - `.lock`, an exclusive lock held while the store is open
//! - `contacts.wal`, the write-ahead log with one CRC32-framed record per commit
//!
//! On open the log is replayed into an in-memory table. A torn final record
//! (crash mid-append) is ignored; corruption anywhere else fails the open.

mod codec;
mod file_lock;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use store::{CompactionResult, PersistentContactStore};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{LinkResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction after a commit (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a durable contact store at the given directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If WAL replay fails due to corruption
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use contactlink::{open_database, IdentityEngine};
///
/// let store = open_database("./contacts.db", None)?;
/// let engine = IdentityEngine::new(Arc::new(store));
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> LinkResult<PersistentContactStore> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), &cfg)
}

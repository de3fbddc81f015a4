//! WAL-backed contact store.
//!
//! Reads are served from an in-memory [`ContactTable`]; every commit is
//! appended to the write-ahead log before it becomes visible.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::error::{ExecutionError, LinkError};
use crate::storage::table::{ContactTable, PendingWork};
use crate::storage::traits::{ContactStore, StorageError, UnitOfWork};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "contacts.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn open_err(what: &str, e: impl std::fmt::Display) -> LinkError {
    LinkError::Execution(ExecutionError::Storage(StorageError::BackendError(format!(
        "{what}: {e}"
    ))))
}

struct Inner {
    dir: PathBuf,
    table: RwLock<ContactTable>,
    last_id: AtomicI64,
    wal: WriteAheadLog,
    max_wal_size: u64,
    _lock: FileLock,
}

impl Inner {
    fn next_id(&self) -> ContactId {
        ContactId::new(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    /// Contacts written to the snapshot record.
    pub contacts: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable contact store. Cheap to clone; clones share the same files.
#[derive(Clone)]
pub struct PersistentContactStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistentContactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContactStore")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

impl PersistentContactStore {
    /// Open or create a store in `dir`, replaying its log.
    ///
    /// # Errors
    /// Fails if the directory cannot be created, another process holds the
    /// lock, or the log contains a corrupted record before its final one.
    pub fn open(dir: &Path, config: &PersistentConfig) -> Result<Self, LinkError> {
        fs::create_dir_all(dir).map_err(|e| open_err("failed to create database directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| open_err("failed to acquire lock", e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| open_err("failed to open WAL", e))?;

        let mut table = ContactTable::default();
        let replayed = Self::replay(&wal, &mut table)?;
        let last_id = table.max_id();
        info!(dir = %dir.display(), replayed, contacts = table.len(), "contact store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                table: RwLock::new(table),
                last_id: AtomicI64::new(last_id),
                wal,
                max_wal_size: config.max_wal_size,
                _lock: lock,
            }),
        })
    }

    fn replay(wal: &WriteAheadLog, table: &mut ContactTable) -> Result<usize, LinkError> {
        let mut count = 0;
        for entry in wal.iter().map_err(|e| open_err("failed to iterate WAL", e))? {
            let entry = entry.map_err(|e| open_err("corrupted WAL entry", e))?;
            match entry.kind {
                WalEntryKind::Commit(batch) => {
                    table.apply(&batch)?;
                }
                WalEntryKind::Snapshot { contacts } => {
                    table.load(contacts)?;
                }
            }
            count += 1;
        }
        Ok(count)
    }

    /// Directory holding the store files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Rewrites the log as a single snapshot of the current table.
    ///
    /// Commits are blocked for the duration.
    ///
    /// # Errors
    /// Returns `BackendError` on I/O failure; the previous log is kept intact.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let table = self.inner.table.write().map_err(|_| lock_err("contact.compact"))?;
        let io = |e: std::io::Error| StorageError::BackendError(format!("compaction failed: {e}"));

        let wal_size_before = self.inner.wal.size_bytes().map_err(io)?;
        let contacts: Vec<Contact> = table.contacts().cloned().collect();
        let count = contacts.len();
        self.inner.wal.rewrite_as_snapshot(contacts).map_err(io)?;
        let wal_size_after = self.inner.wal.size_bytes().map_err(io)?;

        info!(contacts = count, wal_size_before, wal_size_after, "contact log compacted");
        Ok(CompactionResult {
            contacts: count,
            wal_size_before,
            wal_size_after,
        })
    }
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let snapshot = self
            .inner
            .table
            .read()
            .map_err(|_| lock_err("contact.begin"))?
            .version();
        Ok(Box::new(DurableUnitOfWork {
            inner: Arc::clone(&self.inner),
            pending: PendingWork::new(snapshot),
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.inner.table.read().map_err(|_| lock_err("contact.get"))?;
        Ok(table.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<Contact>, StorageError> {
        let table = self.inner.table.read().map_err(|_| lock_err("contact.all"))?;
        Ok(table.contacts().cloned().collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let table = self.inner.table.read().map_err(|_| lock_err("contact.len"))?;
        Ok(table.len())
    }
}

struct DurableUnitOfWork {
    inner: Arc<Inner>,
    pending: PendingWork,
}

impl UnitOfWork for DurableUnitOfWork {
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        let table = self
            .inner
            .table
            .read()
            .map_err(|_| lock_err("contact.find_by_email_or_phone"))?;
        Ok(self.pending.find_by_email_or_phone(&table, email, phone))
    }

    fn find_by_ids_or_linked_ids(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError> {
        let table = self
            .inner
            .table
            .read()
            .map_err(|_| lock_err("contact.find_by_ids_or_linked_ids"))?;
        Ok(self.pending.find_by_ids_or_linked_ids(&table, ids))
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        let id = self.inner.next_id();
        self.pending.create(id, contact, Utc::now())
    }

    fn update_precedence(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError> {
        let table = self
            .inner
            .table
            .read()
            .map_err(|_| lock_err("contact.update_precedence"))?;
        self.pending
            .update_precedence(&table, id, precedence, linked_id, Utc::now())
    }

    fn validate(&self) -> Result<(), StorageError> {
        let table = self.inner.table.read().map_err(|_| lock_err("contact.validate"))?;
        table.validate(self.pending.snapshot(), self.pending.reads())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let Self { inner, pending } = *self;
        let mut table = inner.table.write().map_err(|_| lock_err("contact.commit"))?;
        table.validate(pending.snapshot(), pending.reads())?;

        let batch = pending.into_batch();
        if batch.is_empty() {
            return Ok(());
        }
        table.check_batch(&batch)?;

        let sequence = inner
            .wal
            .append(WalEntryKind::Commit(batch.clone()))
            .map_err(|e| StorageError::BackendError(format!("WAL append failed: {e}")))?;
        let version = table.apply(&batch)?;
        debug!(
            sequence,
            version,
            created = batch.created.len(),
            updated = batch.updates.len(),
            "commit logged"
        );

        // The commit is durable at this point; a failed compaction only
        // leaves a longer log behind.
        match inner.wal.size_bytes() {
            Ok(size) if size > inner.max_wal_size => {
                let contacts: Vec<Contact> = table.contacts().cloned().collect();
                if let Err(e) = inner.wal.rewrite_as_snapshot(contacts) {
                    warn!(error = %e, size, "automatic compaction failed");
                } else {
                    info!(size, contacts = table.len(), "contact log compacted");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to stat WAL"),
        }
        Ok(())
    }
}

//! In-memory storage backend.
//!
//! Thread-safe implementation of [`ContactStore`]. It is intended for
//! embedded usage, tests, and as the reference implementation of the unit of
//! work contract.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::storage::table::{ContactTable, PendingWork};
use crate::storage::traits::{ContactStore, StorageError, UnitOfWork};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct Shared {
    table: RwLock<ContactTable>,
    last_id: AtomicI64,
}

impl Shared {
    fn next_id(&self) -> ContactId {
        ContactId::new(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Thread-safe in-memory contact store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryContactStore {
    shared: Arc<Shared>,
}

impl InMemoryContactStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `contacts`, bypassing the identify
    /// flow. Ids and timestamps are taken as given; new ids continue after
    /// the largest one.
    ///
    /// # Errors
    /// `DuplicateKey` on repeated ids, `InvalidRecord` on malformed links.
    pub fn with_contacts(contacts: Vec<Contact>) -> Result<Self, StorageError> {
        let mut table = ContactTable::default();
        table.load(contacts)?;
        let last_id = table.max_id();
        Ok(Self {
            shared: Arc::new(Shared {
                table: RwLock::new(table),
                last_id: AtomicI64::new(last_id),
            }),
        })
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let snapshot = self
            .shared
            .table
            .read()
            .map_err(|_| lock_err("contact.begin"))?
            .version();
        Ok(Box::new(MemoryUnitOfWork {
            shared: Arc::clone(&self.shared),
            pending: PendingWork::new(snapshot),
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.shared.table.read().map_err(|_| lock_err("contact.get"))?;
        Ok(table.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<Contact>, StorageError> {
        let table = self.shared.table.read().map_err(|_| lock_err("contact.all"))?;
        Ok(table.contacts().cloned().collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let table = self.shared.table.read().map_err(|_| lock_err("contact.len"))?;
        Ok(table.len())
    }
}

struct MemoryUnitOfWork {
    shared: Arc<Shared>,
    pending: PendingWork,
}

impl UnitOfWork for MemoryUnitOfWork {
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        let table = self
            .shared
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
            .shared
            .table
            .read()
            .map_err(|_| lock_err("contact.find_by_ids_or_linked_ids"))?;
        Ok(self.pending.find_by_ids_or_linked_ids(&table, ids))
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        let id = self.shared.next_id();
        self.pending.create(id, contact, Utc::now())
    }

    fn update_precedence(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError> {
        let table = self
            .shared
            .table
            .read()
            .map_err(|_| lock_err("contact.update_precedence"))?;
        self.pending
            .update_precedence(&table, id, precedence, linked_id, Utc::now())
    }

    fn validate(&self) -> Result<(), StorageError> {
        let table = self.shared.table.read().map_err(|_| lock_err("contact.validate"))?;
        table.validate(self.pending.snapshot(), self.pending.reads())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let Self { shared, pending } = *self;
        let mut table = shared.table.write().map_err(|_| lock_err("contact.commit"))?;
        table.validate(pending.snapshot(), pending.reads())?;

        let batch = pending.into_batch();
        if batch.is_empty() {
            return Ok(());
        }
        table.apply(&batch)?;
        Ok(())
    }
}

//! Abstract storage traits for contactlink.
//!
//! The core never talks to a backend directly. It opens a [`UnitOfWork`],
//! performs its reads and writes through it, and commits. Backends guarantee
//! that a unit of work is serializable with respect to every other unit of
//! work on the same store: either all of its writes become visible at once,
//! or commit fails with [`StorageError::Conflict`] and none do.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A concurrent commit invalidated this unit of work's reads.
    #[error("Serialization conflict: {reason}")]
    Conflict {
        reason: String,
    },

    /// A write would produce a malformed record.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true for serialization conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A serializable read-decide-write sequence against a [`ContactStore`].
///
/// Reads observe the unit's own buffered writes. Nothing is visible to other
/// units until [`UnitOfWork::commit`] succeeds; dropping the unit without
/// committing discards every buffered write.
pub trait UnitOfWork {
    /// Records whose `email` equals `email` or whose `phone_number` equals
    /// `phone`. Only supplied fields participate; with both absent the result
    /// is empty.
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Records whose `id` is in `ids` or whose `linked_id` points into `ids`.
    fn find_by_ids_or_linked_ids(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Buffers a new record, assigning its id and creation time.
    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Buffers a link change on an existing record.
    ///
    /// # Errors
    /// `ContactNotFound` if `id` does not exist, `InvalidRecord` if
    /// `linked_id` is not present exactly when `precedence` is secondary.
    fn update_precedence(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError>;

    /// Checks the reads made so far against commits that landed since the
    /// unit began, without committing.
    fn validate(&self) -> Result<(), StorageError>;

    /// Validates and atomically applies all buffered writes.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Storage trait for contact records.
///
/// # Safety Considerations
/// - All mutations go through a [`UnitOfWork`]
/// - Implementations must handle concurrent units of work safely
pub trait ContactStore: Send + Sync {
    /// Opens a new unit of work.
    fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;

    /// Get a contact by ID.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// All committed contacts, ascending by id.
    fn all(&self) -> Result<Vec<Contact>, StorageError>;

    /// Number of committed contacts.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no contact has been committed.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

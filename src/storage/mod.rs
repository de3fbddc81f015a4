//! Storage for contact records.
//!
//! [`ContactStore`] is the abstract collaborator the core consumes. Two
//! backends are provided: [`InMemoryContactStore`] and, with the `persistent`
//! feature, a WAL-backed durable store.

mod memory;
mod table;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryContactStore;
pub use table::{CommitBatch, PrecedenceUpdate};
pub use traits::{ContactStore, StorageError, UnitOfWork};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentContactStore};

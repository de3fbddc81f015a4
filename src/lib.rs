//! # contactlink - Identity Reconciliation for Contact Records
//!
//! contactlink decides which fragmentary contact records (an email here, a
//! phone number there) belong to the same person, keeps each such group under
//! one canonical primary record, and returns the consolidated view.
//!
//! ## Core Concepts
//!
//! - **Contact**: a stored record with an optional email and phone number
//! - **Component**: records transitively connected by a shared email or phone
//! - **Primary**: the earliest-created record of a component; every other
//!   member is a secondary linking directly to it
//! - **Bridge request**: a request whose keys touch two components, merging
//!   them by demoting the younger primary
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use contactlink::{IdentifyRequest, IdentityEngine, InMemoryContactStore};
//!
//! let engine = IdentityEngine::new(Arc::new(InMemoryContactStore::new()));
//!
//! engine.identify(&IdentifyRequest::new(Some("lorraine@hillvalley.edu"), Some("123456")))?;
//! let view = engine.identify(&IdentifyRequest::new(Some("mcfly@hillvalley.edu"), Some("123456")))?;
//!
//! assert_eq!(view.primary_contact_id.get(), 1);
//! assert_eq!(view.emails, ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]);
//! # Ok::<(), contactlink::LinkError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod contact;
pub mod error;
pub mod identity;
pub mod ordered_set;

// Storage, resolution and execution
pub mod engine;
pub mod resolution;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use contact::{Contact, ContactId, LinkPrecedence, NewContact};
pub use engine::runtime::{ExecutionHandle, IdentityRuntime, IdentityRuntimeConfig};
pub use engine::{ConsistencyGuard, EngineConfig, IdentityEngine, RetryPolicy};
pub use error::{ErrorKind, ExecutionError, IntegrityError, LinkError, LinkResult, ValidationError};
pub use identity::{IdentifyRequest, IdentifyResponse, IdentityQuery, IdentityView};
pub use ordered_set::OrderedSet;
pub use storage::{ContactStore, InMemoryContactStore, StorageError, UnitOfWork};

#[cfg(feature = "persistent")]
pub use storage::{open_database, PersistentConfig, PersistentContactStore};

/// gRPC transport (requires the `transport-grpc` feature).
#[cfg(feature = "transport-grpc")]
pub mod transport;

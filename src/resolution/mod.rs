//! Identity resolution: the read-decide-write core of `identify`.
//!
//! The steps run in order inside one unit of work:
//! 1. [`resolve_candidates`] finds every record in the touched component(s)
//! 2. [`reconcile`] picks the canonical primary and demotes/relinks the rest
//! 3. [`merge_if_needed`] adds at most one record for a new key combination
//! 4. [`verify_component`] and [`assemble`] check and render the result
//!
//! Each step is a free function over `&mut dyn UnitOfWork`; the pure planning
//! halves ([`plan_reconciliation`], [`plan_creation`]) never touch the store.

mod assembly;
mod cluster;
mod matcher;
mod merger;

pub use assembly::{assemble, verify_component};
pub use cluster::{plan_reconciliation, reconcile, ReconcilePlan};
pub use matcher::resolve_candidates;
pub use merger::{has_exact, merge_if_needed, plan_creation};

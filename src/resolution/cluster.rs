//! Canonical primary selection and component consolidation.

use std::collections::HashMap;

use crate::contact::{Contact, ContactId, LinkPrecedence};
use crate::error::{IntegrityError, LinkResult};
use crate::storage::UnitOfWork;

/// Link changes needed to bring a candidate set to one consistent component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// The canonical primary: earliest `created_at` among the primaries.
    pub primary_id: ContactId,
    /// Other primaries, demoted to secondaries of `primary_id`.
    pub demoted: Vec<ContactId>,
    /// Secondaries of demoted primaries, re-pointed at `primary_id`.
    pub relinked: Vec<ContactId>,
}

impl ReconcilePlan {
    /// Returns true if the component is already consistent.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.demoted.is_empty() && self.relinked.is_empty()
    }
}

/// Computes the reconciliation for `candidates` without touching the store.
///
/// Returns `Ok(None)` for an empty set.
///
/// # Errors
/// - `MissingPrimary` if the set is non-empty but holds no primary
/// - `UnlinkedSecondary` for a secondary without a link
/// - `DanglingLink` for a secondary whose link target is not in the set
/// - `NonCanonicalLink` for a secondary pointing at another secondary
pub fn plan_reconciliation(candidates: &[Contact]) -> Result<Option<ReconcilePlan>, IntegrityError> {
    if candidates.is_empty() {
        return Ok(None);
    }

    let Some(canonical) = candidates
        .iter()
        .filter(|c| c.is_primary())
        .min_by_key(|c| c.creation_key())
    else {
        return Err(IntegrityError::MissingPrimary {
            members: candidates.len(),
        });
    };
    let primary_id = canonical.id;

    let by_id: HashMap<ContactId, &Contact> = candidates.iter().map(|c| (c.id, c)).collect();

    let mut ordered: Vec<&Contact> = candidates.iter().collect();
    ordered.sort_by_key(|c| c.creation_key());

    let mut demoted = Vec::new();
    let mut relinked = Vec::new();
    for contact in ordered {
        if contact.id == primary_id {
            continue;
        }
        if contact.is_primary() {
            demoted.push(contact.id);
            continue;
        }

        let Some(linked_id) = contact.linked_id else {
            return Err(IntegrityError::UnlinkedSecondary { id: contact.id });
        };
        match by_id.get(&linked_id) {
            None => {
                return Err(IntegrityError::DanglingLink {
                    id: contact.id,
                    linked_id,
                })
            }
            Some(target) if !target.is_primary() => {
                return Err(IntegrityError::NonCanonicalLink {
                    id: contact.id,
                    linked_id,
                    primary_id,
                })
            }
            Some(_) if linked_id != primary_id => relinked.push(contact.id),
            Some(_) => {}
        }
    }

    Ok(Some(ReconcilePlan {
        primary_id,
        demoted,
        relinked,
    }))
}

/// Consolidates `candidates` under their canonical primary.
///
/// Demotions and relinks are written through `uow` and mirrored into
/// `candidates`, so the slice reflects the post-merge state on return.
///
/// # Errors
/// Integrity violations from [`plan_reconciliation`]; store failures
/// propagate unchanged.
pub fn reconcile(
    uow: &mut dyn UnitOfWork,
    candidates: &mut [Contact],
) -> LinkResult<Option<ReconcilePlan>> {
    let Some(plan) = plan_reconciliation(candidates)? else {
        return Ok(None);
    };
    if plan.is_noop() {
        return Ok(Some(plan));
    }

    for &id in plan.demoted.iter().chain(plan.relinked.iter()) {
        uow.update_precedence(id, LinkPrecedence::Secondary, Some(plan.primary_id))?;
    }
    for contact in candidates.iter_mut() {
        if plan.demoted.contains(&contact.id) || plan.relinked.contains(&contact.id) {
            contact.link_precedence = LinkPrecedence::Secondary;
            contact.linked_id = Some(plan.primary_id);
        }
    }
    Ok(Some(plan))
}

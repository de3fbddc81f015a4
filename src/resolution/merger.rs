//! New-record policy.

use crate::contact::{Contact, ContactId, NewContact};
use crate::identity::IdentityQuery;
use crate::storage::{StorageError, UnitOfWork};

/// Returns true if one candidate carries every supplied field of `query`.
///
/// A field absent from the query matches anything.
#[must_use]
pub fn has_exact(query: &IdentityQuery, candidates: &[Contact]) -> bool {
    candidates.iter().any(|c| {
        query.email().map_or(true, |e| c.has_email(e)) && query.phone().map_or(true, |p| c.has_phone(p))
    })
}

/// Decides which record, if any, the request adds.
///
/// `primary_id` is the canonical primary of `candidates`, or `None` when no
/// record matched. Existing records are never touched.
#[must_use]
pub fn plan_creation(
    query: &IdentityQuery,
    primary_id: Option<ContactId>,
    candidates: &[Contact],
) -> Option<NewContact> {
    let email = query.email().map(str::to_string);
    let phone = query.phone().map(str::to_string);

    let Some(primary_id) = primary_id else {
        return Some(NewContact::primary(email, phone));
    };
    if has_exact(query, candidates) {
        return None;
    }

    let email_seen = query
        .email()
        .is_some_and(|e| candidates.iter().any(|c| c.has_email(e)));
    let phone_seen = query
        .phone()
        .is_some_and(|p| candidates.iter().any(|c| c.has_phone(p)));
    (email_seen || phone_seen).then(|| NewContact::secondary(email, phone, primary_id))
}

/// Creates at most one record for `query` and appends it to `candidates`.
///
/// # Errors
/// Propagates store failures unchanged.
pub fn merge_if_needed(
    uow: &mut dyn UnitOfWork,
    query: &IdentityQuery,
    primary_id: Option<ContactId>,
    candidates: &mut Vec<Contact>,
) -> Result<Option<Contact>, StorageError> {
    let Some(new_contact) = plan_creation(query, primary_id, candidates) else {
        return Ok(None);
    };
    let created = uow.create(new_contact)?;
    candidates.push(created.clone());
    Ok(Some(created))
}
